//! Boot-time initializer ordering.
//!
//! Module singletons declare their initializer together with the names
//! of the initializers they depend on; [`run_all`] executes them in a
//! topological order. A cycle or a missing dependency is a fatal boot
//! error.

use alloc::string::String;
use alloc::vec::Vec;

use lepton_core::kinfo;
use lepton_core::sync::SpinLock;

/// An initializer function.
pub type InitFn = fn();

struct InitEntry {
    name: &'static str,
    deps: &'static [&'static str],
    func: InitFn,
    done: bool,
}

static REGISTRY: SpinLock<Vec<InitEntry>> = SpinLock::new(Vec::new());

/// Registers an initializer with its dependency names.
pub fn register(name: &'static str, deps: &'static [&'static str], func: InitFn) {
    let mut registry = REGISTRY.lock();
    assert!(
        registry.iter().all(|e| e.name != name),
        "initializer '{name}' registered twice"
    );
    registry.push(InitEntry {
        name,
        deps,
        func,
        done: false,
    });
}

/// Runs every registered initializer in dependency order.
///
/// # Panics
///
/// Panics on unknown dependencies or dependency cycles.
pub fn run_all() {
    loop {
        let next = {
            let mut registry = REGISTRY.lock();
            let ready = registry.iter().position(|e| {
                !e.done
                    && e.deps.iter().all(|d| {
                        registry
                            .iter()
                            .find(|o| o.name == *d)
                            .unwrap_or_else(|| panic!("initializer '{}' depends on unknown '{d}'", e.name))
                            .done
                    })
            });
            match ready {
                Some(i) => {
                    registry[i].done = true;
                    Some((registry[i].name, registry[i].func))
                }
                None => {
                    if let Some(stuck) = registry.iter().find(|e| !e.done) {
                        panic!("initializer cycle involving '{}'", stuck.name);
                    }
                    None
                }
            }
        };

        match next {
            Some((name, func)) => {
                kinfo!("init: {name}");
                func();
            }
            None => break,
        }
    }
}

/// Returns the names of completed initializers, in completion order
/// (diagnostics).
pub fn completed() -> Vec<String> {
    REGISTRY
        .lock()
        .iter()
        .filter(|e| e.done)
        .map(|e| String::from(e.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn init_a() {
        ORDER.lock().unwrap().push("a");
    }
    fn init_b() {
        ORDER.lock().unwrap().push("b");
    }
    fn init_c() {
        ORDER.lock().unwrap().push("c");
    }

    #[test]
    fn runs_in_dependency_order() {
        // Registered out of order; c depends on b depends on a.
        register("test_c", &["test_b"], init_c);
        register("test_a", &[], init_a);
        register("test_b", &["test_a"], init_b);
        run_all();

        let order = ORDER.lock().unwrap().clone();
        let pos = |n: &str| order.iter().position(|o| *o == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }
}
