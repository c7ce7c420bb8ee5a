mod id;

pub use id::NodeId;
