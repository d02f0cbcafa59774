pub mod artifact;
pub mod backend;
pub mod error;
pub mod host;
pub mod ownership;
pub mod session;
pub mod spec;
pub mod tensor;

pub use artifact::*;
pub use backend::*;
pub use error::*;
pub use ownership::*;
pub use session::*;
pub use spec::*;
pub use tensor::*;
