//! Server side of Courier.
//!
//! A [`Server`] implements exactly one contract, checked at construction.
//! It gives every client a dedicated channel, routes requests to handlers
//! from a [`MethodTable`], and can broadcast events to all connected
//! clients. [`serve`] runs the servers of one host against the broker's
//! directives.

mod host;
mod methods;
mod server;

pub use host::serve;
pub use methods::{HandlerResult, MethodTable};
pub use server::{Server, ServerError};
