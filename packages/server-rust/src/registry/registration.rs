//! Application registration.
//!
//! Registration is the gate in front of everything else: a client may only
//! announce availability, and a caller may only invoke commands, for an
//! application whose spec has been accepted here. Accepting a spec twice is
//! idempotent; accepting a conflicting spec under an existing slug and
//! version is refused so two client fleets cannot fight over one identity.

use std::sync::Arc;

use xtalhub_core::messages::RegisterApplicationPayload;
use xtalhub_core::spec::ApplicationSpec;

use crate::error::RegistryError;
use crate::storage::{ApplicationRecord, RegistryStore};

/// Validates and stores application specs.
pub struct RegistrationService {
    store: Arc<dyn RegistryStore>,
}

impl RegistrationService {
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    /// Handles one `register_application` message.
    pub fn register(
        &self,
        payload: &RegisterApplicationPayload,
    ) -> Result<ApplicationRecord, RegistryError> {
        let spec = &payload.application_spec;
        spec.validate()?;
        validate_slug(&spec.slug)?;

        if let Some(existing) = self.store.get_application(&spec.slug, &spec.version)? {
            if existing.spec == *spec {
                tracing::debug!(
                    slug = %spec.slug,
                    version = %spec.version,
                    "application already registered with an identical spec"
                );
                return Ok(existing);
            }
            return Err(RegistryError::SpecConflict {
                slug: spec.slug.clone(),
                version: spec.version.clone(),
            });
        }

        let record = ApplicationRecord::new(spec.clone());
        self.store.put_application(record.clone())?;
        tracing::info!(
            slug = %spec.slug,
            version = %spec.version,
            commands = spec.commands.len(),
            "application registered"
        );
        Ok(record)
    }

    /// Resolves a registered spec or reports the application unknown.
    pub fn resolve(&self, slug: &str, version: &str) -> Result<ApplicationSpec, RegistryError> {
        self.store
            .get_application(slug, version)?
            .map(|record| record.spec)
            .ok_or_else(|| RegistryError::UnknownApplication {
                slug: slug.to_string(),
                version: version.to_string(),
            })
    }
}

/// Slugs appear inside bus subjects and URLs, so the charset is restricted
/// to lowercase snake case.
fn validate_slug(slug: &str) -> Result<(), RegistryError> {
    let mut chars = slug.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let tail_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if head_ok && tail_ok {
        Ok(())
    } else {
        Err(RegistryError::InvalidSlug(slug.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use xtalhub_core::spec::{CommandSpec, ParameterSpec, ParameterType};

    use super::*;
    use crate::storage::InMemoryStore;

    fn service() -> RegistrationService {
        RegistrationService::new(Arc::new(InMemoryStore::new()))
    }

    fn sample_spec() -> ApplicationSpec {
        ApplicationSpec::new("CrystalExplorer", "crystal_explorer", "21.5").with_command(
            CommandSpec::new("open_file")
                .with_call_pattern("crystalexplorer {input_file}")
                .with_parameter(ParameterSpec::required("input_file", ParameterType::Str)),
        )
    }

    fn payload(spec: ApplicationSpec) -> RegisterApplicationPayload {
        RegisterApplicationPayload {
            application_spec: spec,
            private_routing_key: "xtalhub.inbox.client.test".to_string(),
        }
    }

    #[test]
    fn register_then_resolve() {
        let service = service();
        service.register(&payload(sample_spec())).unwrap();

        let spec = service.resolve("crystal_explorer", "21.5").unwrap();
        assert_eq!(spec.name, "CrystalExplorer");
        assert!(spec.command("open_file").is_some());
    }

    #[test]
    fn identical_reregistration_is_idempotent() {
        let service = service();
        service.register(&payload(sample_spec())).unwrap();
        service.register(&payload(sample_spec())).unwrap();
    }

    #[test]
    fn conflicting_spec_is_refused() {
        let service = service();
        service.register(&payload(sample_spec())).unwrap();

        let changed = sample_spec().with_command(CommandSpec::new("render"));
        let err = service.register(&payload(changed)).unwrap_err();
        assert!(matches!(err, RegistryError::SpecConflict { .. }), "{err}");
    }

    #[test]
    fn unknown_application_is_reported() {
        let err = service().resolve("crystal_explorer", "21.5").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownApplication { .. }));
    }

    #[test]
    fn hostile_slugs_are_refused() {
        let service = service();
        for slug in ["Crystal", "9lives", "has space", "dot.dot", ""] {
            let mut spec = sample_spec();
            spec.slug = slug.to_string();
            let err = service.register(&payload(spec)).unwrap_err();
            assert!(
                matches!(
                    err,
                    RegistryError::InvalidSlug(_) | RegistryError::InvalidSpec(_)
                ),
                "slug {slug:?} gave {err}"
            );
        }
    }

    #[test]
    fn structural_validation_applies() {
        let service = service();
        let mut spec = sample_spec();
        spec.commands.clear();
        let err = service.register(&payload(spec)).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSpec(_)));
    }
}
