//! Contract metadata cache (price tick, size step, minimum size).

use crate::config::ContractDefaults;
use crate::exchange::{normalize_symbol, ContractSpec, ExecutionGateway};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Loads contract metadata lazily and caches it for the process lifetime.
///
/// A failed lookup answers with the configured defaults without caching them,
/// so the next call tries the gateway again.
pub struct ContractBook {
    cache: RwLock<HashMap<String, ContractSpec>>,
    defaults: ContractDefaults,
}

impl ContractBook {
    pub fn new(defaults: ContractDefaults) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    pub async fn get(&self, gateway: &dyn ExecutionGateway, symbol: &str) -> ContractSpec {
        let key = normalize_symbol(symbol);
        if let Some(spec) = self.cache.read().await.get(&key) {
            return spec.clone();
        }

        match gateway.get_contract(symbol).await {
            Ok(spec) => {
                debug!(
                    %symbol,
                    tick = %spec.price_tick,
                    step = %spec.size_step,
                    min = %spec.min_trade_size,
                    "Contract metadata loaded"
                );
                self.cache.write().await.insert(key, spec.clone());
                spec
            }
            Err(e) => {
                warn!(%symbol, error = %e, "Contract metadata unavailable, using defaults");
                self.fallback(&key)
            }
        }
    }

    fn fallback(&self, symbol: &str) -> ContractSpec {
        ContractSpec {
            symbol: symbol.to_string(),
            price_tick: self.defaults.price_tick,
            size_step: self.defaults.size_step,
            min_trade_size: self.defaults.min_trade_size,
        }
    }
}
