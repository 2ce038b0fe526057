use crate::handler::Handler;
use std::{collections::HashMap, fmt, sync::Arc};

/// A named collection of handlers, one per method of a service.
///
/// Handlers are keyed by the snake_case method key (`GetProduct` is served by `get_product`).
#[derive(Clone, Default)]
pub struct Controller {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the handler serving `key`. Both `GetProduct` and `get_product` are accepted.
    pub fn handle(mut self, key: &str, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(method_key(key), Arc::new(handler));
        self
    }

    pub fn handler(&self, key: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(key).cloned()
    }

    pub fn method_keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.method_keys().collect();
        keys.sort_unstable();
        f.debug_struct("Controller").field("handlers", &keys).finish()
    }
}

/// Converts an RPC name into its snake_case method key.
pub fn method_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 4);
    let mut previous: Option<char> = None;
    let mut chars = name.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_uppercase() {
            let after_lower = previous.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit());
            let acronym_end = previous.is_some_and(char::is_uppercase)
                && chars.peek().is_some_and(|n| n.is_lowercase());
            if (after_lower || acronym_end) && !key.ends_with('_') {
                key.push('_');
            }
            key.extend(c.to_lowercase());
        } else {
            key.push(c);
        }
        previous = Some(c);
    }

    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_key() {
        assert_eq!(method_key("GetProduct"), "get_product");
        assert_eq!(method_key("ListProducts"), "list_products");
        assert_eq!(method_key("GetHTTPStatus"), "get_http_status");
        assert_eq!(method_key("Get2FACode"), "get2_fa_code");
        assert_eq!(method_key("already_snake"), "already_snake");
        assert_eq!(method_key("Ping"), "ping");
    }
}
