use thiserror::Error;

use crate::context::{ContextProvider, GraphicsContext, WgpuProvider};
use crate::types::Provider;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(
        "no graphics context available: {preferred} provider failed: {primary}{}",
        describe_fallback(.fallback)
    )]
    Unavailable {
        preferred: Provider,
        primary: String,
        fallback: Option<String>,
    },
}

fn describe_fallback(fallback: &Option<String>) -> String {
    match fallback {
        Some(cause) => format!("; software fallback failed: {cause}"),
        None => String::new(),
    }
}

/// Obtains graphics contexts, falling back to software exactly once.
pub struct ContextAcquirer {
    hardware: Box<dyn ContextProvider>,
    software: Box<dyn ContextProvider>,
}

impl ContextAcquirer {
    pub fn new(hardware: Box<dyn ContextProvider>, software: Box<dyn ContextProvider>) -> Self {
        Self { hardware, software }
    }

    /// Acquirer backed by headless wgpu adapters.
    pub fn wgpu() -> Self {
        Self::new(
            Box::new(WgpuProvider::hardware()),
            Box::new(WgpuProvider::software()),
        )
    }

    pub fn acquire(&self, preferred: Provider) -> Result<GraphicsContext, ContextError> {
        let first = match preferred {
            Provider::Hardware => self.hardware.as_ref(),
            Provider::Software => self.software.as_ref(),
        };

        let primary = match first.create() {
            Ok(provided) => {
                tracing::debug!(provider = %preferred, adapter = %provided.adapter.name, "acquired graphics context");
                return Ok(GraphicsContext::new(preferred, false, provided));
            }
            Err(err) => format!("{err:#}"),
        };

        if preferred == Provider::Software {
            return Err(ContextError::Unavailable {
                preferred,
                primary,
                fallback: None,
            });
        }

        tracing::warn!(
            provider = %preferred,
            error = %primary,
            "graphics context unavailable; falling back to software"
        );
        match self.software.create() {
            Ok(provided) => {
                tracing::info!(adapter = %provided.adapter.name, "acquired software graphics context");
                Ok(GraphicsContext::new(self.software.kind(), true, provided))
            }
            Err(err) => Err(ContextError::Unavailable {
                preferred,
                primary,
                fallback: Some(format!("{err:#}")),
            }),
        }
    }
}
