use gumdrop::Options;
use httpmock::MockServer;

use surge::config::SurgeConfiguration;

/// Not all functions are used by all tests, so we enable allow(dead_code) to
/// avoid compiler warnings during testing.
///
/// The following options are configured by default, if not set to a custom
/// value:
///  --host <mock-server>
///  --users 1
///  --hatch-rate 4
///  --run-time 1
///  --think-time-min 25
///  --think-time-max 50
///  --no-print-metrics
///  -q
#[allow(dead_code)]
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> SurgeConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.base_url();

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to using the mock server if not otherwise configured.
    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", &server_url]);
    }

    // Unless a test plan is custom configured, default to a quick load test.
    if !configuration.contains(&"--test-plan") {
        // Default to testing with 1 user if not otherwise configured.
        if !configuration.contains(&"--users") {
            configuration.extend_from_slice(&["--users", "1"]);
        }

        // Default to hatching 4 users per second if not otherwise configured.
        if !configuration.contains(&"--hatch-rate") {
            configuration.extend_from_slice(&["--hatch-rate", "4"]);
        }

        // Default to running for 1 second if not otherwise configured.
        if !configuration.contains(&"--run-time") {
            configuration.extend_from_slice(&["--run-time", "1"]);
        }
    }

    // Default to a short think time so users pace themselves against the
    // mock server.
    if !configuration.contains(&"--think-time-min") {
        configuration.extend_from_slice(&["--think-time-min", "25"]);
    }
    if !configuration.contains(&"--think-time-max") {
        configuration.extend_from_slice(&["--think-time-max", "50"]);
    }

    // Keep test output quiet.
    if !configuration.contains(&"--no-print-metrics") {
        configuration.push("--no-print-metrics");
    }
    if !configuration.contains(&"-q") {
        configuration.push("-q");
    }

    // Parse these options to generate a SurgeConfiguration.
    SurgeConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}
