pub mod api;
pub mod node;

pub use node::WisNode;
