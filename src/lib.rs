pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{Bitmap, EncodedChunk};
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineHandle, VideoPipeline};

/// Environment variable prefix, e.g. `FRAMECUE__PIPELINE__MAX_QUEUE_SIZE=12`.
pub const ENV_PREFIX: &str = "FRAMECUE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub decode: DecodeConfig,
    pub surface: SurfaceConfig,
}

/// Presentation scheduling, fixed for the lifetime of one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    /// Frames requested per `request_ahead` call.
    pub nb_frames_to_check: usize,
    /// Look-ahead window; also the presentation margin.
    pub request_margin_ms: f64,
    pub max_queue_size: usize,
    pub tick_rate_hz: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub codec: String,
    /// Encoded chunks allowed to wait for the decode worker.
    pub command_queue_depth: usize,
    /// Decode errors tolerated before switching to fallback capture.
    pub max_decode_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub max_pending_draws: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            nb_frames_to_check: 4,
            request_margin_ms: 100.0,
            max_queue_size: 8,
            tick_rate_hz: 60.0, // vsync-ish
        }
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            codec: "mjpeg".into(),
            command_queue_depth: 16,
            max_decode_errors: 3,
        }
    }
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            max_pending_draws: 2,
        }
    }
}

impl PipelineConfig {
    /// Margin within which a queued frame counts as due, in seconds.
    pub fn present_margin(&self) -> f64 {
        self.request_margin_ms / 1000.0
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(PipelineError::invalid_config("max_queue_size must be >= 1"));
        }
        if self.nb_frames_to_check == 0 {
            return Err(PipelineError::invalid_config(
                "nb_frames_to_check must be >= 1",
            ));
        }
        if !(self.request_margin_ms >= 0.0 && self.request_margin_ms.is_finite()) {
            return Err(PipelineError::invalid_config(
                "request_margin_ms must be a non-negative number",
            ));
        }
        if !(self.tick_rate_hz > 0.0 && self.tick_rate_hz.is_finite()) {
            return Err(PipelineError::invalid_config("tick_rate_hz must be positive"));
        }
        Ok(())
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `FRAMECUE__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if self.decode.command_queue_depth == 0 {
            return Err(PipelineError::invalid_config(
                "decode.command_queue_depth must be >= 1",
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a pipeline's frame accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub queue_depth: usize,
    pub inserted: usize,
    pub presented: usize,
    pub evicted: usize,
    pub flushed: usize,
    pub stale: usize,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
        assert!((PipelineConfig::default().present_margin() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn rejects_zero_queue() {
        let mut config = Config::default();
        config.pipeline.max_queue_size = 0;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_negative_margin() {
        let mut config = PipelineConfig::default();
        config.request_margin_ms = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("framecue-{}.toml", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "[pipeline]\nmax_queue_size = 3\n\n[decode]\ncodec = \"jpeg\"").unwrap();
        }

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.pipeline.max_queue_size, 3);
        assert_eq!(config.pipeline.nb_frames_to_check, 4);
        assert_eq!(config.decode.codec, "jpeg");
        assert_eq!(config.surface.max_pending_draws, 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = Path::new("/definitely/not/here/framecue.toml");
        assert!(matches!(
            Config::load(Some(path)),
            Err(PipelineError::Config(_))
        ));
    }
}
