use beamflow_core::supervisor::Supervisor;
use clap::Subcommand;

use crate::output::{print_field, OutputFormat};

#[derive(Subcommand)]
pub enum CircuitBreakerCommand {
    /// Show a named breaker's current state
    Status {
        name: String,
    },

    /// Force a named breaker back to closed
    Reset {
        name: String,
    },
}

pub async fn run(command: CircuitBreakerCommand, supervisor: &Supervisor, output: OutputFormat) -> anyhow::Result<()> {
    let breakers = supervisor.circuit_breakers();
    match command {
        CircuitBreakerCommand::Status { name } => {
            let status = breakers.status(&name);
            if output.is_text() {
                print_field("name", &status.name);
                print_field("state", &status.state.to_string());
                print_field("failures", &status.failure_count.to_string());
                print_field("successes", &status.success_count.to_string());
                if let Some(opened_at) = status.opened_at {
                    print_field("opened_at", &opened_at.to_rfc3339());
                }
            } else {
                output.print_value(&status);
            }
        }
        CircuitBreakerCommand::Reset { name } => {
            breakers.reset(&name);
            if output.is_text() {
                println!("reset {name}");
            } else {
                output.print_value(&serde_json::json!({ "reset": name }));
            }
        }
    }
    Ok(())
}
