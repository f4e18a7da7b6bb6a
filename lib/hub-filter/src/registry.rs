//! Explicit table of available filters

use std::sync::Arc;

use crate::filter::{FilterSettings, ObjectFilter, ServiceResolver};
use crate::{discardcloudservice, inclusterconfig, masterservice, servicetopology};
use crate::{FilterError, Result};

/// Builds a filter from the node-local settings
pub type FilterFactory = Box<dyn Fn(&FilterSettings) -> Arc<dyn ObjectFilter> + Send + Sync>;

/// Named filter factories in registration order
pub struct FilterRegistry {
    factories: Vec<(&'static str, FilterFactory)>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self { factories: Vec::new() }
    }

    /// Registry with every built-in filter
    pub fn with_defaults(services: Arc<dyn ServiceResolver>) -> Result<Self> {
        let mut registry = Self::new();
        let entries: Vec<(&'static str, FilterFactory)> = vec![
            (
                masterservice::NAME,
                Box::new(|settings: &FilterSettings| -> Arc<dyn ObjectFilter> {
                    Arc::new(masterservice::MasterServiceFilter::new(settings))
                }),
            ),
            (
                servicetopology::NAME,
                Box::new(move |settings: &FilterSettings| -> Arc<dyn ObjectFilter> {
                    Arc::new(servicetopology::ServiceTopologyFilter::new(settings, services.clone()))
                }),
            ),
            (
                discardcloudservice::NAME,
                Box::new(|_: &FilterSettings| -> Arc<dyn ObjectFilter> {
                    Arc::new(discardcloudservice::DiscardCloudServiceFilter)
                }),
            ),
            (
                inclusterconfig::NAME,
                Box::new(|_: &FilterSettings| -> Arc<dyn ObjectFilter> {
                    Arc::new(inclusterconfig::InClusterConfigFilter)
                }),
            ),
        ];
        for (name, factory) in entries {
            registry.register(name, factory)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: &'static str, factory: FilterFactory) -> Result<()> {
        if self.factories.iter().any(|(n, _)| *n == name) {
            return Err(FilterError::DuplicateFilter(name.to_string()));
        }
        self.factories.push((name, factory));
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|(name, _)| *name).collect()
    }

    /// Instantiate every registered filter not listed in `disabled`
    pub fn build(&self, settings: &FilterSettings, disabled: &[String]) -> Result<Vec<Arc<dyn ObjectFilter>>> {
        if let Some(unknown) = disabled.iter().find(|d| !self.names().contains(&d.as_str())) {
            return Err(FilterError::UnknownFilter(unknown.clone()));
        }
        Ok(self
            .factories
            .iter()
            .filter(|(name, _)| !disabled.iter().any(|d| d == name))
            .map(|(_, factory)| factory(settings))
            .collect())
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Service;

    struct NoServices;

    #[async_trait]
    impl ServiceResolver for NoServices {
        async fn service(&self, _namespace: &str, _name: &str) -> Option<Service> {
            None
        }
    }

    #[test]
    fn test_defaults_register_every_filter() {
        let registry = FilterRegistry::with_defaults(Arc::new(NoServices)).unwrap();
        assert_eq!(
            registry.names(),
            vec![
                masterservice::NAME,
                servicetopology::NAME,
                discardcloudservice::NAME,
                inclusterconfig::NAME
            ]
        );
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = FilterRegistry::with_defaults(Arc::new(NoServices)).unwrap();
        let err = registry
            .register(
                discardcloudservice::NAME,
                Box::new(|_: &FilterSettings| -> Arc<dyn ObjectFilter> {
                    Arc::new(discardcloudservice::DiscardCloudServiceFilter)
                }),
            )
            .unwrap_err();
        assert!(matches!(err, FilterError::DuplicateFilter(_)));
    }

    #[test]
    fn test_build_honours_disabled() {
        let registry = FilterRegistry::with_defaults(Arc::new(NoServices)).unwrap();
        let settings = FilterSettings::default();

        let filters = registry
            .build(&settings, &[servicetopology::NAME.to_string()])
            .unwrap();
        assert_eq!(filters.len(), 3);
        assert!(filters.iter().all(|f| f.name() != servicetopology::NAME));

        assert!(matches!(
            registry.build(&settings, &["nosuchfilter".to_string()]),
            Err(FilterError::UnknownFilter(_))
        ));
    }
}
