//! Bounded cache of parsed expressions.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::debug;

use crate::ast::Expr;
use crate::date_macro::Clock;
use crate::error::FilterError;
use crate::parser::ParseOptions;

/// LRU cache from source text to a shared AST.
///
/// Expressions containing datetime macros are never cached: their literals
/// are resolved against the clock at parse time.
pub struct ExprCache {
    entries: Mutex<LruCache<(String, ParseOptions), Arc<Expr>>>,
}

impl ExprCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_parse(
        &self,
        source: &str,
        options: ParseOptions,
        clock: &dyn Clock,
    ) -> Result<Arc<Expr>, FilterError> {
        let key = (source.trim().to_string(), options);
        if let Some(expr) = self.lock().get(&key) {
            return Ok(Arc::clone(expr));
        }

        let expr = Arc::new(crate::parse_with(source, options, clock)?);
        if expr.has_macros() {
            debug!(source, "not caching expression with datetime macros");
        } else {
            self.lock().put(key, Arc::clone(&expr));
        }
        Ok(expr)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<(String, ParseOptions), Arc<Expr>>> {
        // A poisoned cache still holds valid entries.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
