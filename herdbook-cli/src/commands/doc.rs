use clap::{Args, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use herdbook_core::document::format_timestamp;
use herdbook_core::{LocalDocument, Query};

use super::{runtime, CommandError, OutputFormat, Session};
use crate::config::Config;

#[derive(Args)]
pub struct DocCommand {
    #[command(subcommand)]
    pub command: DocSubcommand,
}

#[derive(Subcommand)]
pub enum DocSubcommand {
    /// Create or replace a document
    Put {
        collection: String,

        /// JSON payload
        data: String,

        /// Document ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Soft-delete a document
    Rm { collection: String, id: String },

    /// List documents
    Ls {
        collection: String,

        /// Field equality filter, e.g. `species=cattle` or `dam.tag=A12`
        #[arg(long = "where", value_name = "FIELD=VALUE")]
        filters: Vec<String>,

        /// Include deleted documents
        #[arg(long)]
        deleted: bool,

        #[arg(long)]
        limit: Option<usize>,

        /// Keep printing the result set as it changes, until Ctrl-C
        #[arg(long)]
        follow: bool,

        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a document
    Get {
        collection: String,
        id: String,

        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl DocSubcommand {
    pub fn is_read(&self) -> bool {
        matches!(self, DocSubcommand::Ls { .. } | DocSubcommand::Get { .. })
    }

    pub fn is_write(&self) -> bool {
        matches!(self, DocSubcommand::Put { .. } | DocSubcommand::Rm { .. })
    }
}

impl DocCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        let rt = runtime()?;
        rt.block_on(async {
            let session = Session::open(config).await?;
            self.execute(&session).await
        })
    }

    async fn execute(&self, session: &Session) -> Result<(), CommandError> {
        let store = &session.store;
        match &self.command {
            DocSubcommand::Put { collection, data, id } => {
                let data: Value = serde_json::from_str(data)
                    .map_err(|e| CommandError::InvalidInput(format!("Invalid JSON payload: {}", e)))?;
                let id = id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
                store.register(collection)?;
                let doc = store.write(collection, &id, data).await?;
                println!("Saved {}/{} at {}", collection, doc.id, format_timestamp(&doc.updated_at));
            }
            DocSubcommand::Rm { collection, id } => {
                store.register(collection)?;
                store.soft_delete(collection, id).await?;
                println!("Deleted {}/{}", collection, id);
            }
            DocSubcommand::Ls {
                collection,
                filters,
                deleted,
                limit,
                follow,
                format,
            } => {
                store.register(collection)?;
                let query = build_query(filters, *deleted, *limit)?;
                if *follow {
                    let mut live = store.subscribe(collection, query).await?;
                    loop {
                        tokio::select! {
                            docs = live.next() => match docs {
                                Some(docs) => print_list(&docs, format)?,
                                None => break,
                            },
                            _ = tokio::signal::ctrl_c() => break,
                        }
                    }
                    live.unsubscribe();
                } else {
                    let docs = store.find(collection, &query).await?;
                    print_list(&docs, format)?;
                }
            }
            DocSubcommand::Get {
                collection,
                id,
                format,
            } => {
                store.register(collection)?;
                let doc = store.get(collection, id).await?.ok_or_else(|| {
                    CommandError::InvalidInput(format!("Document '{}' not found in '{}'", id, collection))
                })?;
                match format {
                    OutputFormat::Json => println!("{}", to_json(&doc)?),
                    OutputFormat::Text => print_doc(&doc),
                }
            }
        }
        Ok(())
    }
}

fn build_query(filters: &[String], deleted: bool, limit: Option<usize>) -> Result<Query, CommandError> {
    let mut query = Query::all();
    for filter in filters {
        let (field, value) = parse_filter(filter)?;
        query = query.where_eq(field, value);
    }
    if deleted {
        query = query.with_deleted();
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    Ok(query)
}

/// `field=value`; the value is read as JSON when it parses, else as a string.
fn parse_filter(filter: &str) -> Result<(String, Value), CommandError> {
    let (field, raw) = filter.split_once('=').ok_or_else(|| {
        CommandError::InvalidInput(format!("Filter must look like FIELD=VALUE: {}", filter))
    })?;
    if field.is_empty() {
        return Err(CommandError::InvalidInput(format!("Empty field in filter: {}", filter)));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((field.to_string(), value))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, CommandError> {
    serde_json::to_string_pretty(value).map_err(|e| CommandError::InvalidInput(e.to_string()))
}

fn print_list(docs: &[LocalDocument], format: &OutputFormat) -> Result<(), CommandError> {
    match format {
        OutputFormat::Json => println!("{}", to_json(&docs)?),
        OutputFormat::Text => {
            if docs.is_empty() {
                println!("No documents found.");
                return Ok(());
            }
            for doc in docs {
                let marker = if doc.deleted { " (deleted)" } else { "" };
                println!(
                    "{:<38} {}{}  {}",
                    doc.id,
                    format_timestamp(&doc.updated_at),
                    marker,
                    doc.data
                );
            }
        }
    }
    Ok(())
}

fn print_doc(doc: &LocalDocument) {
    println!("ID:      {}", doc.id);
    println!("Updated: {}", format_timestamp(&doc.updated_at));
    if doc.deleted {
        println!("Deleted: yes");
    }
    println!();
    match serde_json::to_string_pretty(&doc.data) {
        Ok(pretty) => println!("{}", pretty),
        Err(_) => println!("{}", doc.data),
    }
}
