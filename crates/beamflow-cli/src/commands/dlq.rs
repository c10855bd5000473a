use beamflow_core::model::DlqFilter;
use beamflow_core::supervisor::Supervisor;
use clap::Subcommand;

use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead-letter entries
    List {
        #[arg(long)]
        workflow_id: Option<String>,

        #[arg(long)]
        kind: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show a single dead-letter entry
    Get {
        id: String,
    },

    /// Bring an entry's next retry forward to now
    RetryNow {
        id: String,
    },

    /// Mark an entry resolved, with an operator note
    Resolve {
        id: String,
        resolution: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Mark an entry permanently abandoned
    Abandon {
        id: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Run one sweep pass now and report what it did
    Sweep {
        #[arg(long, default_value = "100")]
        limit: usize,
    },
}

pub async fn run(command: DlqCommand, supervisor: &Supervisor, output: OutputFormat) -> anyhow::Result<()> {
    let dlq = supervisor.dlq();
    match command {
        DlqCommand::List { workflow_id, kind, limit } => {
            let filter = DlqFilter {
                workflow_id,
                kind,
                status: None,
            };
            let entries = dlq.list(filter, limit).await?;
            if output.is_text() {
                print_table_header(&[("ID", 30), ("WORKFLOW", 20), ("STATUS", 14), ("RETRIES", 10)]);
                for e in &entries {
                    print_table_row(&[
                        (e.id.as_str(), 30),
                        (e.workflow_id.as_str(), 20),
                        (format!("{:?}", e.status).as_str(), 14),
                        (format!("{}/{}", e.retry_count, e.max_retries).as_str(), 10),
                    ]);
                }
            } else {
                output.print_value(&entries);
            }
        }
        DlqCommand::Get { id } => {
            let entry = dlq.get(&id).await?;
            match entry {
                Some(entry) if output.is_text() => {
                    print_field("id", &entry.id);
                    print_field("workflow_id", &entry.workflow_id);
                    print_field("status", &format!("{:?}", entry.status));
                    print_field("retries", &format!("{}/{}", entry.retry_count, entry.max_retries));
                    print_field("error", &entry.error.message);
                    print_field("critical", &entry.critical.to_string());
                }
                Some(entry) => output.print_value(&entry),
                None => anyhow::bail!("dlq entry not found: {id}"),
            }
        }
        DlqCommand::RetryNow { id } => {
            let entry = dlq.retry_now(&id).await?;
            if output.is_text() {
                print_field("id", &entry.id);
                print_field("next_retry_at", &entry.next_retry_at.to_rfc3339());
            } else {
                output.print_value(&entry);
            }
        }
        DlqCommand::Resolve { id, resolution, notes } => {
            dlq.resolve(&id, &resolution, notes.as_deref()).await?;
            if output.is_text() {
                println!("resolved {id}");
            }
        }
        DlqCommand::Abandon { id, notes } => {
            dlq.abandon(&id, notes.as_deref()).await?;
            if output.is_text() {
                println!("abandoned {id}");
            }
        }
        DlqCommand::Sweep { limit } => {
            let result = dlq.sweep(limit).await?;
            let mut restarted = Vec::new();
            let mut restart_failed = Vec::new();
            for (entry, derived_id) in &result.to_restart {
                match supervisor.start_workflow(&entry.kind, derived_id, entry.original_params.clone()).await {
                    Ok(_) => restarted.push(derived_id.clone()),
                    Err(e) => {
                        tracing::warn!(workflow_id = %derived_id, kind = %entry.kind, error = %e, "dlq sweep restart failed");
                        restart_failed.push((derived_id.clone(), e.to_string()));
                    }
                }
            }
            if output.is_text() {
                println!("restarting: {}", result.to_restart.len());
                for (entry, derived_id) in &result.to_restart {
                    println!("  {} -> {derived_id} (kind={})", entry.workflow_id, entry.kind);
                }
                if !restart_failed.is_empty() {
                    println!("restart failures: {}", restart_failed.len());
                    for (id, err) in &restart_failed {
                        println!("  {id}: {err}");
                    }
                }
                println!("exhausted: {}", result.exhausted.len());
                for id in &result.exhausted {
                    println!("  {id}");
                }
            } else {
                output.print_value(&serde_json::json!({
                    "restarted": restarted,
                    "restart_failed": restart_failed.iter().map(|(id, err)| serde_json::json!({"workflow_id": id, "error": err})).collect::<Vec<_>>(),
                    "exhausted": result.exhausted,
                }));
            }
        }
    }
    Ok(())
}
