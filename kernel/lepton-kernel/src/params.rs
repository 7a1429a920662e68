//! Kernel parameters.
//!
//! Boot-command-line `name=value` pairs, parsed once during early boot
//! and queried by subsystems at init time.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};

use lepton_core::sync::SpinLock;

static PARAMS: SpinLock<BTreeMap<String, String>> = SpinLock::new(BTreeMap::new());

/// Parses a boot command line, replacing the parameter table.
///
/// Tokens without `=` become flags with an empty value.
pub fn parse_cmdline(cmdline: &str) {
    let mut table = BTreeMap::new();
    for token in cmdline.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => table.insert(key.to_string(), value.to_string()),
            None => table.insert(token.to_string(), String::new()),
        };
    }
    *PARAMS.lock() = table;
}

/// Returns a parameter's value.
pub fn get(name: &str) -> Option<String> {
    PARAMS.lock().get(name).cloned()
}

/// Returns a parameter parsed as an integer.
pub fn get_u64(name: &str) -> Option<u64> {
    get(name)?.parse().ok()
}

/// Returns `true` if the flag parameter is present.
pub fn has(name: &str) -> bool {
    PARAMS.lock().contains_key(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_query() {
        parse_cmdline("console.uart.port=com1 debug quiet=0 ticks=1000");
        assert_eq!(get("console.uart.port").as_deref(), Some("com1"));
        assert_eq!(get_u64("ticks"), Some(1000));
        assert!(has("debug"));
        assert!(!has("missing"));
        assert_eq!(get("missing"), None);
    }
}
