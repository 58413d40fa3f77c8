//! The compiled-program cache.
//!
//! Programs are keyed by `(shape, compile flags)` and live for the process
//! lifetime. Lookups take the read lock only; a miss compiles outside any
//! critical section and publishes with a double-checked insert, so two
//! racing compilations of the same key may both run but only one result is
//! installed and the loser's copy is dropped.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use facet::Shape;
use parking_lot::RwLock;

use crate::compile::{self, CompileFlags};
use crate::error::Error;
use crate::marshal::ShapeKey;
use crate::program::Program;

type CacheKey = (ShapeKey, CompileFlags);

static CACHE: LazyLock<RwLock<HashMap<CacheKey, Arc<Program>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Returns the cached program for `(shape, flags)`, compiling on a miss.
/// Compilation failures are not cached; a later call retries.
pub(crate) fn get_or_compile(
    shape: &'static Shape<'static>,
    flags: CompileFlags,
) -> Result<Arc<Program>, Error> {
    let key = (ShapeKey::of(shape), flags);

    {
        let cache = CACHE.read();
        if let Some(program) = cache.get(&key) {
            return Ok(Arc::clone(program));
        }
    }

    let compiled = Arc::new(compile::compile(shape)?);

    let mut cache = CACHE.write();
    let installed = cache.entry(key).or_insert(compiled);
    Ok(Arc::clone(installed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use facet::Facet;

    #[derive(Facet)]
    struct Cached {
        a: String,
    }

    #[test]
    fn repeated_lookups_return_the_same_program() {
        let flags = CompileFlags::current();
        let p1 = get_or_compile(Cached::SHAPE, flags).unwrap();
        let p2 = get_or_compile(Cached::SHAPE, flags).unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
    }

    #[test]
    fn distinct_flags_get_distinct_entries() {
        let p1 = get_or_compile(Cached::SHAPE, CompileFlags { marshal_epoch: u32::MAX }).unwrap();
        let p2 = get_or_compile(
            Cached::SHAPE,
            CompileFlags {
                marshal_epoch: u32::MAX - 1,
            },
        )
        .unwrap();
        assert!(!Arc::ptr_eq(&p1, &p2));
    }

    #[test]
    fn concurrent_misses_converge_on_one_program() {
        #[derive(Facet)]
        struct Raced {
            b: u64,
        }
        let flags = CompileFlags::current();
        let programs: Vec<Arc<Program>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(move || get_or_compile(Raced::SHAPE, flags).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for program in &programs[1..] {
            assert!(Arc::ptr_eq(&programs[0], program));
        }
    }
}
