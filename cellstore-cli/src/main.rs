use cellstore::{parse_schema, FileStorage, Persister, Scalar, Store};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

/// cellstore CLI: read and write a cellstore JSON file from the command line
#[derive(Parser)]
#[command(name = "cellstore", version, about)]
struct Cli {
    /// Path to the store file
    #[arg(long, default_value = "cellstore.json")]
    data: PathBuf,

    /// Schema file (YAML or JSON) to install before running the command.
    /// Schemas are not stored in the data file, so pass this on every run
    /// that should be checked against one.
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Print all tables, or one table, row or cell
    Get {
        table: Option<String>,
        row: Option<String>,
        cell: Option<String>,
    },

    /// Print all values, or one value
    Values {
        value: Option<String>,
    },

    /// Set a cell (the value is parsed as JSON, falling back to a string)
    SetCell {
        table: String,
        row: String,
        cell: String,
        value: String,
    },

    /// Set a value (parsed as JSON, falling back to a string)
    SetValue {
        value_id: String,
        value: String,
    },

    /// Add a row under a generated id
    AddRow {
        table: String,
        /// Cell values (e.g. --cell species=dog)
        #[arg(long = "cell", value_parser = parse_key_value)]
        cells: Vec<(String, String)>,
        /// Reuse ids of deleted rows
        #[arg(long)]
        reuse_ids: bool,
    },

    /// Delete a cell, or reset it to its schema default
    DelCell {
        table: String,
        row: String,
        cell: String,
        /// Remove the whole row even if the cell has a default
        #[arg(long)]
        force: bool,
    },

    DelRow {
        table: String,
        row: String,
    },

    DelTable {
        table: String,
    },

    DelValue {
        value_id: String,
    },

    /// Install a schema file into the store, or print the current schema.
    ///
    /// Installing coerces the data file to the schema and saves the result,
    /// but the schema itself is not saved. Without FILE this prints only
    /// what `--schema` installed for this run.
    Schema {
        file: Option<PathBuf>,
    },

    /// Follow the store file and print every change to it
    Watch,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::new();
    let persister = Persister::new(&store, FileStorage::new(&cli.data));

    if let Command::Watch = cli.command {
        return watch(&persister, &cli.data, cli.schema.as_ref(), cli.format);
    }

    persister.load()?;
    if let Some(path) = &cli.schema {
        install_schema(&store, path)?;
    }

    match cli.command {
        Command::Get { table, row, cell } => {
            let output = match (table, row, cell) {
                (Some(t), Some(r), Some(c)) => {
                    scalar_output(store.get_cell(&t, &r, &c).as_ref())
                }
                (Some(t), Some(r), None) => {
                    let row = store.get_row(&t, &r);
                    serde_json::to_value(row)?
                }
                (Some(t), None, _) => serde_json::to_value(store.get_table(&t))?,
                (None, _, _) => serde_json::from_str(&store.get_tables_json())?,
            };
            print_output(&output, cli.format)?;
        }

        Command::Values { value } => {
            let output = match value {
                Some(v) => scalar_output(store.get_value(&v).as_ref()),
                None => serde_json::from_str(&store.get_values_json())?,
            };
            print_output(&output, cli.format)?;
        }

        Command::SetCell {
            table,
            row,
            cell,
            value,
        } => {
            store.set_cell(&table, &row, &cell, parse_scalar(&value));
            persister.save()?;
            let output = json!({
                "ok": store.has_cell(&table, &row, &cell),
                "cell": scalar_output(store.get_cell(&table, &row, &cell).as_ref()),
            });
            print_output(&output, cli.format)?;
        }

        Command::SetValue { value_id, value } => {
            store.set_value(&value_id, parse_scalar(&value));
            persister.save()?;
            let output = json!({
                "ok": store.has_value(&value_id),
                "value": scalar_output(store.get_value(&value_id).as_ref()),
            });
            print_output(&output, cli.format)?;
        }

        Command::AddRow {
            table,
            cells,
            reuse_ids,
        } => {
            let row = fields_to_value(&cells);
            let row_id = store
                .add_row(&table, row, reuse_ids)
                .ok_or_else(|| format!("Row rejected for table '{table}'"))?;
            persister.save()?;
            print_output(&json!({ "row_id": row_id }), cli.format)?;
        }

        Command::DelCell {
            table,
            row,
            cell,
            force,
        } => {
            store.del_cell(&table, &row, &cell, force);
            persister.save()?;
            print_output(&json!({ "ok": true }), cli.format)?;
        }

        Command::DelRow { table, row } => {
            store.del_row(&table, &row);
            persister.save()?;
            print_output(&json!({ "ok": true, "deleted": row }), cli.format)?;
        }

        Command::DelTable { table } => {
            store.del_table(&table);
            persister.save()?;
            print_output(&json!({ "ok": true, "deleted": table }), cli.format)?;
        }

        Command::DelValue { value_id } => {
            store.del_value(&value_id);
            persister.save()?;
            print_output(&json!({ "ok": true, "deleted": value_id }), cli.format)?;
        }

        Command::Schema { file } => {
            if let Some(path) = file {
                install_schema(&store, &path)?;
                persister.save()?;
            }
            let schema: serde_json::Value = serde_json::from_str(&store.get_schema_json())?;
            print_output(&schema, cli.format)?;
        }

        Command::Watch => {}
    }

    Ok(())
}

fn install_schema(store: &Store, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let schema = parse_schema(path)?;
    store.set_schema(schema.tables, schema.values);
    Ok(())
}

fn watch(
    persister: &Persister<FileStorage>,
    data: &Path,
    schema: Option<&PathBuf>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = persister.store();
    persister.start_auto_load((json!({}), json!({})))?;
    if let Some(path) = schema {
        install_schema(store, path)?;
    }

    store.add_cell_listener(
        None,
        None,
        None,
        move |_, table_id, row_id, cell_id, new, old| {
            let change = json!({
                "table": table_id,
                "row": row_id,
                "cell": cell_id,
                "old": scalar_output(old),
                "new": scalar_output(new),
            });
            if let Err(e) = print_output(&change, format) {
                log::warn!("Failed to print change: {e}");
            }
        },
        false,
    );
    store.add_value_listener(
        None,
        move |_, value_id, new, old| {
            let change = json!({
                "value": value_id,
                "old": scalar_output(old),
                "new": scalar_output(new),
            });
            if let Err(e) = print_output(&change, format) {
                log::warn!("Failed to print change: {e}");
            }
        },
        false,
    );

    log::info!("Watching {}", data.display());
    loop {
        if let Err(e) = persister.poll_auto_load() {
            log::warn!("Reload failed: {e}");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn print_output(
    value: &serde_json::Value,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn scalar_output(scalar: Option<&Scalar>) -> serde_json::Value {
    scalar.map(Scalar::to_json).unwrap_or(serde_json::Value::Null)
}

/// Parse as JSON (numbers, booleans, quoted strings), falling back to the
/// raw text as a string.
fn parse_scalar(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn fields_to_value(fields: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        map.insert(key.clone(), parse_scalar(val));
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_schema_help_says_schema_is_not_saved() {
        let cli = Cli::command();
        let help = cli
            .find_subcommand("schema")
            .and_then(|schema| schema.get_long_about())
            .map(|help| help.to_string())
            .unwrap();
        assert!(help.contains("the schema itself is not saved"));

        let flag = Cli::command()
            .get_arguments()
            .find(|arg| arg.get_id() == "schema")
            .and_then(|arg| arg.get_long_help().or(arg.get_help()))
            .map(|help| help.to_string())
            .unwrap();
        assert!(flag.contains("not stored in the data file"));
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("species=dog").unwrap(), ("species".into(), "dog".into()));
        assert!(parse_key_value("species").is_err());
    }
}
