use beamflow_core::model::WorkflowFilter;
use beamflow_core::supervisor::Supervisor;
use clap::Subcommand;
use serde_json::Value;

use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Start a new workflow instance
    Start {
        /// Registered workflow kind, e.g. order_fulfillment
        kind: String,

        /// Workflow instance id. Generated if omitted.
        #[arg(long)]
        id: Option<String>,

        /// Start params as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Show a single workflow instance
    Get {
        id: String,
    },

    /// List workflow instances
    List {
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        kind: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show the event history for a workflow instance
    Events {
        id: String,
    },

    /// Resume a non-terminal workflow instance from its last known node
    Resume {
        id: String,
    },

    /// Force a running workflow instance to cancel and compensate
    Cancel {
        id: String,
    },
}

pub async fn run(command: WorkflowCommand, supervisor: &Supervisor, output: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match command {
        WorkflowCommand::Start { kind, id, params } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
            let params: Value = serde_json::from_str(&params)?;
            let record = supervisor.start_workflow(&kind, &id, params).await?;
            if output.is_text() {
                if !quiet {
                    print_field("id", &record.id);
                    print_field("kind", &record.kind);
                    print_field("status", &record.status.to_string());
                }
            } else {
                output.print_value(&record);
            }
        }
        WorkflowCommand::Get { id } => {
            let record = supervisor.get(&id).await?;
            match record {
                Some(record) if output.is_text() => {
                    print_field("id", &record.id);
                    print_field("kind", &record.kind);
                    print_field("status", &record.status.to_string());
                    print_field("current_node", record.current_node_id.as_deref().unwrap_or("-"));
                    print_field("step", &format!("{}/{}", record.current_step_index, record.total_steps));
                    if let Some(error) = &record.error {
                        print_field("error", &error.message);
                    }
                }
                Some(record) => output.print_value(&record),
                None => anyhow::bail!("workflow not found: {id}"),
            }
        }
        WorkflowCommand::List { status, kind, limit } => {
            let filter = WorkflowFilter {
                status: status.as_deref().map(parse_status).transpose()?,
                kind,
                date_from: None,
                date_to: None,
                search: None,
            };
            let records = supervisor.store().list_workflows(filter, limit).await?;
            if output.is_text() {
                print_table_header(&[("ID", 36), ("KIND", 20), ("STATUS", 14), ("STEP", 8)]);
                for r in &records {
                    print_table_row(&[
                        (r.id.as_str(), 36),
                        (r.kind.as_str(), 20),
                        (r.status.to_string().as_str(), 14),
                        (format!("{}/{}", r.current_step_index, r.total_steps).as_str(), 8),
                    ]);
                }
            } else {
                output.print_value(&records);
            }
        }
        WorkflowCommand::Events { id } => {
            let events = supervisor.store().get_events(&id).await?;
            if output.is_text() {
                print_table_header(&[("SEQ", 6), ("TYPE", 24), ("TIMESTAMP", 30)]);
                for e in &events {
                    print_table_row(&[
                        (e.sequence_number.to_string().as_str(), 6),
                        (format!("{:?}", e.event_type).as_str(), 24),
                        (e.timestamp.to_rfc3339().as_str(), 30),
                    ]);
                }
            } else {
                output.print_value(&events);
            }
        }
        WorkflowCommand::Resume { id } => {
            let record = supervisor.resume(&id).await?;
            if output.is_text() {
                print_field("id", &record.id);
                print_field("status", &record.status.to_string());
            } else {
                output.print_value(&record);
            }
        }
        WorkflowCommand::Cancel { id } => {
            let record = supervisor.cancel(&id).await?;
            if output.is_text() {
                print_field("id", &record.id);
                print_field("status", &record.status.to_string());
            } else {
                output.print_value(&record);
            }
        }
    }
    Ok(())
}

fn parse_status(s: &str) -> anyhow::Result<beamflow_core::model::WorkflowStatus> {
    use beamflow_core::model::WorkflowStatus::*;
    Ok(match s {
        "pending" => Pending,
        "running" => Running,
        "completed" => Completed,
        "failed" => Failed,
        "compensating" => Compensating,
        "abandoned" => Abandoned,
        other => anyhow::bail!("unknown workflow status: {other}"),
    })
}
