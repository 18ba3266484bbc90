use std::collections::HashMap;

use crate::backend::{BackendDescriptor, BackendRegistry};
use crate::core::settings::Settings;

/// Picks the backend for a source. Preference order: a session override
/// for the kind, then the persisted mime preference, then the persisted
/// kind preference, then the currently bound backend if it still fits,
/// then the first registered backend supporting the kind.
#[derive(Default)]
pub struct BackendSelector {
    forced: HashMap<String, String>,
}

impl BackendSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the backend for `kind` for this session and remembers
    /// the choice in the settings.
    pub fn force(&mut self, kind: impl Into<String>, backend: impl Into<String>, settings: &mut Settings) {
        let kind = kind.into();
        let backend = backend.into();
        settings.kind_backends.insert(kind.clone(), backend.clone());
        self.forced.insert(kind, backend);
    }

    pub fn resolve<'a>(
        &self,
        registry: &'a BackendRegistry,
        settings: &Settings,
        kind: &str,
        mime: Option<&str>,
        current: Option<&str>,
    ) -> Option<&'a BackendDescriptor> {
        let candidates = [
            self.forced.get(kind).map(String::as_str),
            mime.and_then(|m| settings.mime_backends.get(m)).map(String::as_str),
            settings.kind_backends.get(kind).map(String::as_str),
            current,
        ];
        for name in candidates.into_iter().flatten() {
            if let Some(desc) = registry.find(name) {
                if desc.supports.contains(&kind) {
                    return Some(desc);
                }
                log::debug!("backend {} does not support {}, skipping", name, kind);
            }
        }
        registry.first_supporting(kind)
    }
}
