//! # SafeTrail Tools
//!
//! Built-in capability providers for the SafeTrail agent.
//! Every provider is simulated: values are drawn from a shared, optionally
//! seeded random source so runs can be made reproducible.

pub mod assistance;
pub mod signals;

use rand::SeedableRng;
use rand::rngs::StdRng;
use safetrail_core::delivery::ContactDirectory;
use safetrail_core::dispatcher::{Tool, ToolRegistry};
use std::sync::{Arc, Mutex, PoisonError};

/// Random source shared by the simulated providers.
pub struct SharedRng {
    inner: Mutex<StdRng>,
}

impl SharedRng {
    /// Seeded when `seed` is given, otherwise from OS entropy.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let mut rng = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}

/// Register all built-in tools.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    contacts: Arc<dyn ContactDirectory>,
    seed: Option<u64>,
) {
    let rng = Arc::new(SharedRng::new(seed));

    let tools: Vec<Arc<dyn Tool>> = vec![
        // Environmental signals used by the monitor
        Arc::new(signals::WeatherTool::new(rng.clone())),
        Arc::new(signals::TrafficTool::new(rng.clone())),
        Arc::new(signals::NewsTool::new(rng.clone())),
        // Actions a generated response may request
        Arc::new(assistance::EmergencyServicesTool::new(contacts)),
        Arc::new(assistance::RouteOptimizerTool::new(rng.clone())),
        Arc::new(assistance::RiskPredictorTool::new(rng.clone())),
        Arc::new(assistance::SafetyCheckTool::new(rng)),
        Arc::new(assistance::LearnPatternTool),
    ];

    for tool in tools {
        if let Err(e) = registry.register(tool) {
            tracing::warn!("Failed to register tool: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use safetrail_core::delivery::StaticContactDirectory;

    #[test]
    fn test_register_builtin_tools() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, Arc::new(StaticContactDirectory::new()), Some(7));
        assert_eq!(
            registry.list_names(),
            vec![
                "emergency_services",
                "learn_pattern",
                "news_api",
                "risk_predictor",
                "route_optimizer",
                "safety_check",
                "traffic_api",
                "weather_api",
            ]
        );
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        use rand::Rng;
        let a = SharedRng::new(Some(42));
        let b = SharedRng::new(Some(42));
        let xs: Vec<u32> = (0..5).map(|_| a.with(|r| r.gen_range(0..1000))).collect();
        let ys: Vec<u32> = (0..5).map(|_| b.with(|r| r.gen_range(0..1000))).collect();
        assert_eq!(xs, ys);
    }
}
