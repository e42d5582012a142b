//! OpenTelemetry setup: a tracing-subscriber pipeline with an optional OTLP
//! exporter, configured the same `Config`/`from_env()` way the rest of this
//! codebase configures itself, plus a small instrumentation helper for the
//! engine's own synthesis spans (one target operation, one step, one
//! attempt, one scenario at a time).

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Telemetry configuration: service name, optional OTLP endpoint, sampling
/// ratio, and whether to also log to the console.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// `None` means console-only, no OTLP export.
    pub otlp_endpoint: Option<String>,
    /// 0.0 (never sample) to 1.0 (always sample).
    pub sampling_ratio: f64,
    pub enable_console_logging: bool,
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "api-synth".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Reads `OTEL_SERVICE_NAME`, `OTEL_EXPORTER_OTLP_ENDPOINT`, and
    /// `OTEL_TRACES_SAMPLER_ARG` over the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }
        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }

        config
    }
}

/// Initializes the tracing-subscriber pipeline. With an OTLP endpoint
/// configured, spans are exported via gRPC in addition to (optionally)
/// console logging; without one, console logging is all there is.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
        let telemetry_layer = OpenTelemetryLayer::new(tracer.clone());
        let subscriber = tracing_subscriber::registry().with(env_filter).with(telemetry_layer);

        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "telemetry initialized with OTLP export"
        );

        Ok(Some(tracer))
    } else {
        let subscriber = tracing_subscriber::registry().with(env_filter);

        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }

        tracing::info!("telemetry initialized, console only");
        Ok(None)
    }
}

fn init_otlp_tracer(service_name: &str, endpoint: &str, sampling_ratio: f64) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new("service.name", service_name.to_string())])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);
    Ok(tracer)
}

/// Flushes any pending batched spans. Call before the process exits.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
    tracing::info!("telemetry shut down");
}

/// Instrumentation helpers for the engine's own synthesis spans.
#[allow(dead_code)]
pub mod instrumentation {
    use std::time::Instant;

    /// One synthesis step's span context: a target operation, a step
    /// within its plan, and the attempt number within that step's retry
    /// loop, optionally tagged with the scenario being materialized.
    #[derive(Debug)]
    pub struct SynthesisSpanContext {
        pub target_op_id: String,
        pub suffixed_op_id: String,
        pub attempt: u32,
        pub start_time: Instant,
        pub status_code: Option<u16>,
        pub duration_ms: Option<u64>,
        pub scenario_name: Option<String>,
    }

    impl SynthesisSpanContext {
        pub fn new(target_op_id: &str, suffixed_op_id: &str, attempt: u32) -> Self {
            Self {
                target_op_id: target_op_id.to_string(),
                suffixed_op_id: suffixed_op_id.to_string(),
                attempt,
                start_time: Instant::now(),
                status_code: None,
                duration_ms: None,
                scenario_name: None,
            }
        }

        pub fn with_scenario(mut self, name: &str) -> Self {
            self.scenario_name = Some(name.to_string());
            self
        }

        pub fn finish(&mut self, status_code: u16) {
            self.status_code = Some(status_code);
            self.duration_ms = Some(self.start_time.elapsed().as_millis() as u64);
        }

        pub fn attributes(&self) -> Vec<(&'static str, String)> {
            let mut attrs = vec![
                ("target.op_id", self.target_op_id.clone()),
                ("step.op_id", self.suffixed_op_id.clone()),
                ("step.attempt", self.attempt.to_string()),
            ];

            if let Some(scenario) = &self.scenario_name {
                attrs.push(("scenario.name", scenario.clone()));
            }
            if let Some(status) = self.status_code {
                attrs.push(("http.status_code", status.to_string()));
            }
            if let Some(duration) = self.duration_ms {
                attrs.push(("step.duration_ms", duration.to_string()));
            }

            attrs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_console_only() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "api-synth");
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
        assert!(config.enable_console_logging);
    }

    #[test]
    fn synthesis_span_context_tracks_attempt_and_scenario() {
        use instrumentation::SynthesisSpanContext;

        let mut ctx = SynthesisSpanContext::new("createOrder", "createOrder_1", 2).with_scenario("quantityTooLarge_ST");
        assert_eq!(ctx.target_op_id, "createOrder");
        assert_eq!(ctx.attempt, 2);
        assert!(ctx.status_code.is_none());

        ctx.finish(400);

        assert_eq!(ctx.status_code, Some(400));
        assert!(ctx.duration_ms.is_some());

        let attrs = ctx.attributes();
        assert!(attrs.iter().any(|(k, v)| *k == "target.op_id" && v == "createOrder"));
        assert!(attrs.iter().any(|(k, v)| *k == "scenario.name" && v == "quantityTooLarge_ST"));
        assert!(attrs.iter().any(|(k, v)| *k == "http.status_code" && v == "400"));
    }
}
