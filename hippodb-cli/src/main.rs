use clap::{Parser, Subcommand, ValueEnum};
use hippodb::{Lookup, RowKey, SearchOptions, Store, StoreConfig};
use std::path::PathBuf;
use std::process;

/// HippoDB CLI: load a directory of JSON tables, join them, and query them
#[derive(Parser)]
#[command(name = "hippodb", version, about)]
struct Cli {
    /// Path to the data directory (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Store config file (JSON or YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Schema document, relative to the data directory. Without one,
    /// every JSON/YAML table in the data directory is loaded.
    #[arg(long)]
    schema: Option<String>,

    /// Sqlite file holding snapshots between runs
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Persist table rows, not just the schema
    #[arg(long)]
    save_tables: bool,

    /// Store snapshots uncompressed
    #[arg(long)]
    no_compress: bool,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Show version, last save time, and mounted tables
    Info,

    /// List known tables and their sources
    List {
        /// Only tables from this source
        #[arg(long)]
        source: Option<String>,
    },

    /// Show a table's column types
    Describe {
        /// Table id
        table: String,
    },

    /// Get a single row by id
    Find {
        /// Table id
        table: String,
        /// Row id
        id: String,
    },

    /// Search a table. The lookup is JSON (object or array of pairs) or a
    /// string lookup such as `*`, `active`, `!active`, `count(user_id)>2`
    Search {
        /// Table id
        table: String,
        /// Lookup expression
        lookup: String,
        /// Anchor text patterns at both ends
        #[arg(long)]
        exact: bool,
        /// Match text patterns case-sensitively
        #[arg(long)]
        case_sensitive: bool,
        /// Keep at most this many rows
        #[arg(long)]
        limit: Option<usize>,
        /// Sort by a field path (repeatable)
        #[arg(long = "sort-by")]
        sort_by: Vec<String>,
        /// Expand foreign keys one level in the output
        #[arg(long)]
        joined: bool,
    },

    /// Insert a row
    Insert {
        /// Table id
        table: String,
        /// Field values (e.g. --field name="Alice Chen")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Always assign the next integer id
        #[arg(long)]
        auto_increment: bool,
    },

    /// Merge fields into an existing row
    Update {
        /// Table id
        table: String,
        /// Row id
        id: String,
        /// Field values to update (e.g. --field status=closed)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Remove every row matching a lookup
    Remove {
        /// Table id
        table: String,
        /// Lookup expression, as for `search`
        lookup: String,
    },

    /// Restore a table to its source rows
    Revert {
        /// Table id
        table: String,
    },

    /// Write snapshots to the cache
    Save,

    /// Remove this store's snapshot and forget everything loaded
    Reset,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn build_config(cli: &Cli) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::default(),
    };
    if let Some(schema) = &cli.schema {
        config = config.with_source(schema);
    }
    if cli.save_tables {
        config = config.with_save_tables(true);
    }
    if cli.no_compress {
        config = config.with_compress(false);
    }
    Ok(config)
}

fn open_store(cli: &Cli) -> Result<Store, Box<dyn std::error::Error>> {
    let config = build_config(cli)?;
    let scan = config.source.is_none();
    let name = config.name.clone();
    let mut store = Store::open(config, &cli.data_dir, cli.cache.as_deref())?;

    if scan {
        let descriptors = hippodb::FsSource::new(&cli.data_dir).scan_tables(&name)?;
        log::debug!(
            "Scanned {} table(s) in {}",
            descriptors.len(),
            cli.data_dir.display()
        );
        for descriptor in descriptors {
            store.check(descriptor);
        }
    }
    store.init()?;
    Ok(store)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = open_store(&cli)?;

    match &cli.command {
        Command::Info => {
            print_output(&serde_json::to_value(store.info())?, &cli.format);
        }

        Command::List { source } => {
            print_output(&serde_json::to_value(store.list(source.as_deref()))?, &cli.format);
        }

        Command::Describe { table } => {
            print_output(&serde_json::to_value(store.describe(table)?)?, &cli.format);
        }

        Command::Find { table, id } => {
            let row = store
                .find(table, parse_row_key(id))?
                .map(|r| r.to_joined_value())
                .unwrap_or(serde_json::Value::Bool(false));
            print_output(&row, &cli.format);
        }

        Command::Search {
            table,
            lookup,
            exact,
            case_sensitive,
            limit,
            sort_by,
            joined,
        } => {
            let options = SearchOptions {
                exact_match: *exact,
                ignore_case: !*case_sensitive,
                limit: *limit,
                sort_by: sort_by.clone(),
            };
            let result = store.search_opts(table, parse_lookup(lookup)?, &options)?;
            let rows = if *joined {
                result.to_joined_values()
            } else {
                result.to_values()
            };
            print_output(&serde_json::Value::Array(rows), &cli.format);
        }

        Command::Insert {
            table,
            fields,
            auto_increment,
        } => {
            let row = store.insert(table, fields_to_value(fields, None), *auto_increment)?;
            print_output(&row.to_value(), &cli.format);
        }

        Command::Update { table, id, fields } => {
            let data = fields_to_value(fields, Some(parse_row_key(id)));
            let row = store.update(table, data)?;
            print_output(&row.to_value(), &cli.format);
        }

        Command::Remove { table, lookup } => {
            let left = store.remove(table, parse_lookup(lookup)?)?.len();
            print_output(&serde_json::json!({ "ok": true, "rows": left }), &cli.format);
        }

        Command::Revert { table } => {
            let rows = store.revert(table)?.len();
            print_output(&serde_json::json!({ "ok": true, "rows": rows }), &cli.format);
        }

        Command::Save => {
            store.save()?;
            print_output(&serde_json::to_value(store.info())?, &cli.format);
        }

        Command::Reset => {
            store.reset()?;
            print_output(&serde_json::json!({ "ok": true, "reset": true }), &cli.format);
        }
    }

    Ok(())
}

fn parse_row_key(id: &str) -> RowKey {
    id.parse::<i64>()
        .map(RowKey::Int)
        .unwrap_or_else(|_| RowKey::Str(id.to_string()))
}

/// JSON objects, arrays and integers are parsed; anything else is a string lookup.
fn parse_lookup(lookup: &str) -> Result<Lookup, Box<dyn std::error::Error>> {
    match serde_json::from_str::<serde_json::Value>(lookup) {
        Ok(value @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
            Ok(Lookup::from_json(value)?)
        }
        Ok(value @ serde_json::Value::Number(_)) if value.is_i64() => {
            Ok(Lookup::from_json(value)?)
        }
        _ => Ok(Lookup::from(lookup)),
    }
}

fn print_output(value: &serde_json::Value, format: &OutputFormat) {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)
            .map(|s| s + "\n")
            .map_err(|e| e.to_string()),
        OutputFormat::Yaml => serde_yaml::to_string(value).map_err(|e| e.to_string()),
    };
    match rendered {
        Ok(text) => print!("{text}"),
        Err(e) => eprintln!("ERROR:{e}"),
    }
}

fn fields_to_value(fields: &[(String, String)], id: Option<RowKey>) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    if let Some(id) = id {
        map.insert("id".to_string(), id.to_value());
    }
    for (key, val) in fields {
        // numbers, booleans, arrays and objects parse as JSON; the rest stays text
        let json_val = serde_json::from_str(val).unwrap_or(serde_json::Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    serde_json::Value::Object(map)
}
