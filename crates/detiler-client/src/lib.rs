//! detiler-client — typed HTTP access to a detiler service.
//!
//! [`DetilerClient`] wraps every API route. Tile and cooldown searches can
//! be walked page by page with [`TilePager`] and [`CooldownPager`], both of
//! which stop early on a [`CancelToken`]. [`ViewportSession`] turns map
//! viewport changes into de-duplicated tile queries.
//!
//! ```text
//! DetilerClient
//!   ├── send()       retry loop, upstream errors only
//!   │   └── send_once()  connect → http1 handshake → request, under timeout
//!   ├── tile_pager()     cursor pages, raced against CancelToken
//!   └── cooldown_pager() offset pages, raced against CancelToken
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod pager;
pub mod session;

pub use cancel::{CancelHandle, CancelToken};
pub use client::DetilerClient;
pub use config::{ClientConfig, RetryStrategy};
pub use error::{ClientError, ClientResult};
pub use pager::{CooldownPager, TilePager};
pub use session::ViewportSession;
