use std::fmt;

use anyhow::Error;
use serde::Serialize;

/// Pipeline stage a fatal error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Synthesis,
    Timeline,
    Assembly,
    Trim,
    Output,
    Cancelled,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Synthesis => "synthesis",
            Stage::Timeline => "timeline",
            Stage::Assembly => "assembly",
            Stage::Trim => "trim",
            Stage::Output => "output",
            Stage::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(Stage::Cancelled, "job was cancelled")
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                stage: self.stage,
                message: self.message.clone(),
            },
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage.label(), self.message)
    }
}

impl std::error::Error for StageError {}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub stage: Stage,
    pub message: String,
}

pub fn find_stage_error(error: &Error) -> Option<&StageError> {
    // anyhow's own downcast sees through context layers; the chain walk
    // covers StageErrors that were raised as root causes of foreign errors.
    error.downcast_ref::<StageError>().or_else(|| {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<StageError>())
    })
}

/// Tags an error with the stage it escaped from, keeping the original chain
/// as context so `{:#}` still shows the root cause.
pub fn tag_stage(error: Error, stage: Stage) -> Error {
    if find_stage_error(&error).is_some() {
        return error;
    }
    let message = format!("{error:#}");
    error.context(StageError::new(stage, message))
}

/// Extension for attaching a stage to any `anyhow::Result`.
pub trait StageResultExt<T> {
    fn stage(self, stage: Stage) -> anyhow::Result<T>;
}

impl<T> StageResultExt<T> for anyhow::Result<T> {
    fn stage(self, stage: Stage) -> anyhow::Result<T> {
        self.map_err(|error| tag_stage(error, stage))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn tagged_error_is_found_through_context_chain() {
        let error = tag_stage(anyhow!("ffmpeg exited with status 1"), Stage::Assembly)
            .context("while rendering job");
        let found = find_stage_error(&error).expect("stage error should be in chain");
        assert_eq!(found.stage, Stage::Assembly);
        assert!(found.message.contains("ffmpeg exited"));
    }

    #[test]
    fn first_tag_wins() {
        let inner: anyhow::Result<()> = Err(anyhow!("voice service timed out"));
        let error = inner
            .stage(Stage::Synthesis)
            .stage(Stage::Timeline)
            .expect_err("should fail");
        assert_eq!(
            find_stage_error(&error).map(|e| e.stage),
            Some(Stage::Synthesis)
        );
    }

    #[test]
    fn envelope_serializes_stage_in_snake_case() {
        let envelope = StageError::new(Stage::Input, "script has no threads").envelope();
        let json = serde_json::to_value(&envelope).expect("envelope should serialize");
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["stage"], "input");
        assert_eq!(json["error"]["message"], "script has no threads");
    }
}
