mod stream;

pub use stream::{DeferredRequest, RequestStream, TrimAction};
