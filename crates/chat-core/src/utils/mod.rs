//! Text and lookup helpers

mod lookup;
mod text;

pub use lookup::{find, get};
pub use text::{escape_markdown, escape_mentions, resolve_invite, resolve_template};
