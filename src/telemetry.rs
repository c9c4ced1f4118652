// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::fmt::Debug;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::{Event, Subscriber, field};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

const LOG_FORMAT: &str = "LOG_FORMAT";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    fn from_env() -> LogFormat {
        match env::var(LOG_FORMAT).as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// Installs the global subscriber. Events are formatted on the calling task and
/// handed to a dedicated writer thread; the returned guard flushes it on drop and
/// must be held for the life of the process.
pub fn setup_logging() -> WorkerGuard {
    Lazy::force(&APPLICATION_START_TIME);
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::registry()
        .with(fmt_layer(writer, LogFormat::from_env()).with_filter(default_env_filter()))
        .init();
    guard
}

/// A formatting layer writing to `writer`.
pub fn fmt_layer<W>(writer: W, format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync + 'static>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .event_format(tracing_subscriber::fmt::format().json().flatten_event(true))
                .fmt_fields(format::JsonFields::default())
                .with_writer(writer),
        ),
        LogFormat::Plain => Box::new(
            tracing_subscriber::fmt::layer()
                .event_format(TunnelFormat())
                .fmt_fields(TunnelFormat())
                .with_writer(writer),
        ),
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_regex(false)
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy()
}

// TunnelFormat writes tab separated lines: time, level, target and spans, message, fields.
struct TunnelFormat();

struct Visitor<'writer> {
    res: std::fmt::Result,
    is_empty: bool,
    writer: Writer<'writer>,
}

impl Visitor<'_> {
    fn write_padded(&mut self, value: &impl Debug) -> std::fmt::Result {
        let padding = if self.is_empty {
            self.is_empty = false;
            ""
        } else {
            " "
        };
        write!(self.writer, "{padding}{value:?}")
    }
}

impl field::Visit for Visitor<'_> {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        if self.res.is_err() {
            return;
        }
        self.record_debug(field, &value)
    }

    fn record_debug(&mut self, field: &field::Field, val: &dyn Debug) {
        self.res = match field.name() {
            "message" => write!(self.writer, "{val:?}\t"),
            _ => self.write_padded(&format_args!("{}={:?}", field.name(), val)),
        }
    }
}

impl<'writer> FormatFields<'writer> for TunnelFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'writer>,
        fields: R,
    ) -> std::fmt::Result {
        let mut visitor = Visitor {
            writer,
            res: Ok(()),
            is_empty: true,
        };
        fields.record(&mut visitor);
        visitor.res
    }
}

impl<S, N> FormatEvent<S, N> for TunnelFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        use tracing_log::NormalizeEvent;
        use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
        let normalized_meta = event.normalized_metadata();
        SystemTime.format_time(&mut writer)?;
        let meta = normalized_meta.as_ref().unwrap_or_else(|| event.metadata());
        write!(writer, "\t{}\t", meta.level().as_str().to_ascii_lowercase())?;

        let target = meta.target();
        let target = target
            .strip_prefix("kube_tunnel_proxy::")
            .unwrap_or(target);
        write!(writer, "{target}")?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.metadata().name())?;
                let ext = span.extensions();
                if let Some(fields) = &ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        };
        if event.fields().any(|_| true) {
            write!(writer, "\t")?;
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::telemetry::LogCapture;
    use tracing::{info, info_span};

    #[test]
    fn plain_lines_carry_span_fields() {
        let capture = LogCapture::default();
        let subscriber =
            tracing_subscriber::registry().with(fmt_layer(capture.clone(), LogFormat::Plain));
        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!("tunnel", context = %"c1", tag = %"app=x");
            span.in_scope(|| info!(port = 80, "No pods found: app=x"));
        });
        let line = capture.contents();
        let fields: Vec<&str> = line.trim_end().split('\t').collect();
        assert_eq!(fields[1], "info");
        assert_eq!(
            fields[2],
            "telemetry::tests:tunnel{context=c1 tag=app=x}"
        );
        assert_eq!(fields[3], "No pods found: app=x");
        assert_eq!(fields[4], "port=80");
    }

    #[test]
    fn json_lines() {
        let capture = LogCapture::default();
        let subscriber =
            tracing_subscriber::registry().with(fmt_layer(capture.clone(), LogFormat::Json));
        tracing::subscriber::with_default(subscriber, || {
            info!(context = "c1", "Setting up 2 tunnels.");
        });
        let v: serde_json::Value = serde_json::from_str(capture.contents().trim()).unwrap();
        assert_eq!(v["message"], "Setting up 2 tunnels.");
        assert_eq!(v["context"], "c1");
        assert_eq!(v["level"], "INFO");
    }
}
