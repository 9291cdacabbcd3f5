//! URL handling module for Lapis-Watch
//!
//! Provides URL normalization (the identity of a page record), host
//! extraction and the include/exclude scope used by the crawl frontier.

mod domain;
mod normalize;
mod scope;

pub use domain::{extract_domain, same_host};
pub use normalize::{normalize_parsed, normalize_url};
pub use scope::UrlScope;
