pub mod delegate;
pub mod loader;
pub mod locate;
pub mod runtime;

pub use delegate::{NativeDelegate, NativeSession};
pub use loader::{api_from_entry, load_delegate_once};
