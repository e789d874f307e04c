pub mod console;
pub mod http;
pub mod ingress;
pub mod media;
pub mod util;

pub use console::ConsoleDispatcher;
pub use http::HttpDispatcher;
pub use ingress::{InboundHandler, IngressWorkerPool};
pub use media::HttpMediaValidator;
