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

use once_cell::sync::Lazy;
use tracing_subscriber::fmt::TestWriter;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::telemetry::{self, LogFormat};

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<()> = Lazy::new(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::registry()
        .with(telemetry::fmt_layer(TestWriter::new(), LogFormat::Plain).with_filter(filter))
        .try_init();
});

/// Routes logs through the test harness so they show up for failing tests.
pub fn initialize_telemetry() {
    Lazy::force(&TRACING);
}
