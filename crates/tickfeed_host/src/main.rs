#![forbid(unsafe_code)]

mod config;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tickfeed_client::{HttpResolver, IngestClient};
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::sink::LoggingSink;

const STATS_EVERY: Duration = Duration::from_secs(60);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tickfeed_host [--config path] [--tick-hz n]\n\
\n\
Options:\n\
\t--config   Config file (default: ~/.tickfeed/config.toml)\n\
\t--tick-hz  Host ticks per second (overrides config)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	tick_hz: Option<u32>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		tick_hz: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--tick-hz" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				match v.trim().parse::<u32>() {
					Ok(hz) if hz > 0 => args.tick_hz = Some(hz),
					_ => {
						eprintln!("--tick-hz must be a positive integer");
						usage_and_exit();
					}
				}
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tickfeed_client=debug,tickfeed_host=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tickfeed_host");
				global::set_tracer_provider(tracer_provider);

				base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut host_cfg = config::load_host_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded host config (toml + env overrides)");
	if let Some(hz) = args.tick_hz {
		host_cfg.tick_hz = hz;
	}

	init_metrics(host_cfg.metrics_bind.as_deref());

	let resolver = Arc::new(HttpResolver::new(host_cfg.resolver_config())?);
	let mut client = IngestClient::with_handle(
		Handle::current(),
		host_cfg.client_config(),
		resolver,
		Box::new(LoggingSink::default()),
	);
	client.set_source_url(host_cfg.source_url.clone());
	client.set_reconnect_enabled(host_cfg.reconnect_enabled);

	if host_cfg.auto_connect {
		client.connect();
	} else {
		info!("auto_connect disabled; idle until restarted with auto_connect");
	}

	let period = Duration::from_secs_f64(1.0 / f64::from(host_cfg.tick_hz));
	let mut ticker = tokio::time::interval(period);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
	let mut stats_ticker = tokio::time::interval(STATS_EVERY);
	stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

	info!(tick_hz = host_cfg.tick_hz, "tickfeed_host running (ctrl-c to stop)");

	let shutdown = tokio::signal::ctrl_c();
	tokio::pin!(shutdown);

	loop {
		tokio::select! {
			_ = ticker.tick() => {
				client.tick();
			}
			_ = stats_ticker.tick() => {
				let stats = client.stats();
				debug!(
					phase = %stats.phase,
					forwarded = stats.forwarded,
					dedup_suppressed = stats.dedup_suppressed,
					chat_dropped = stats.chat_dropped,
					donation_dropped = stats.donation_dropped,
					decode_errors = stats.decode_errors,
					"ingest stats"
				);
			}
			res = &mut shutdown => {
				if let Err(e) = res {
					warn!(error = %e, "ctrl-c handler failed; shutting down");
				}
				break;
			}
		}
	}

	info!("shutting down");
	client.disconnect();
	// Flush the final status and relayed log lines.
	client.tick();

	Ok(())
}
