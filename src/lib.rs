pub mod condition;
pub mod config;
pub mod manager;
pub mod response;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use condition::{AllPending, AnyCompletion, Completions, ResponseDone, StoppingCondition, WaitProgress};
pub use config::ManagerConfig;
pub use manager::{Connection, ConnectionManager, ManagerError, RpcChannel, RpcError, SendError};
pub use response::{Closure, RemoteResponse, Status};
pub use server::Server;
pub use shutdown::{ShutdownToken, install_signal_handler};
pub use transport::{Context, Frame, Socket, TcpContext, TransportError};
