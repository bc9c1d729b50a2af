mod store;

pub use store::FileBlockStore;
