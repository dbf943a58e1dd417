use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};

use config::{CoordinationConfig, wire};
use serde::de::DeserializeOwned;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(author, version, about, long_about = None)]
/// Cli tool for parsing config & JSON schema
pub struct Args {
    /// path to zkcoord config. We will determine format from extension. If no extension, we will attempt JSON & YAML
    #[arg(short = 'p', long, value_parser)]
    pub path: PathBuf,
    /// print the parsed wire format or the validated config
    #[arg(short = 'f', long, value_enum)]
    pub format: Option<Format>,
    /// path to JSON schema. Config must be in JSON format and use `.json` extension
    #[arg(short = 's', long, value_parser)]
    pub schema: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Wire,
    Internal,
}

fn main() -> Result<()> {
    let args = Args::parse();
    println!("found config at path = {}", args.path.display());

    parse_schema(&args)?;
    if let Some(format) = args.format {
        match format {
            Format::Wire => {
                let wire_cfg = parse_wire::<wire::Config>(&args)?;
                println!("printing wire format");
                println!("{:#?}", wire_cfg);
            }
            Format::Internal => {
                let cfg = CoordinationConfig::try_from(parse_wire::<wire::Config>(&args)?)?;
                println!("parsed wire format into validated config, pretty printing");
                println!("{:#?}", cfg);
                println!("namespace prefix = {}", cfg.prefix());
            }
        }
    }

    Ok(())
}

fn parse_schema(args: &Args) -> Result<()> {
    if let Some(schema) = &args.schema {
        let parsed = serde_json::from_str::<serde_json::Value>(
            &std::fs::read_to_string(schema).context("failed to find schema")?,
        )?;
        let input = parse_wire::<serde_json::Value>(args)?;
        // compile errors borrow the schema, so flatten them to a string here
        let validator = jsonschema::JSONSchema::options()
            .with_draft(jsonschema::Draft::Draft7)
            .compile(&parsed)
            .map_err(|err| anyhow!("failed to compile schema: {err}"))?;
        return if let Err(errs) = validator.validate(&input) {
            errs.for_each(|err| eprintln!("{}", err));
            Err(anyhow!("failed to validate schema"))
        } else {
            println!("json schema validated");
            Ok(())
        };
    }
    Ok(())
}

fn parse_wire<T: DeserializeOwned>(args: &Args) -> Result<T> {
    let input = std::fs::read_to_string(&args.path).context("failed to find config")?;

    Ok(match args.path.extension() {
        Some(ext) if ext == "json" => serde_json::from_str(&input)?,
        Some(ext) if ext == "yaml" || ext == "yml" => serde_yaml::from_str(&input)?,
        _ => match serde_json::from_str(&input) {
            Ok(r) => r,
            Err(_err) => {
                println!("failed parsing from json, trying yaml");
                serde_yaml::from_str(&input)?
            }
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(path: &str, schema: Option<&str>) -> Args {
        let root = env!("CARGO_MANIFEST_DIR");
        Args {
            path: PathBuf::from(format!("{root}/../libs/config/sample/{path}")),
            format: None,
            schema: schema.map(|s| PathBuf::from(format!("{root}/../libs/config/{s}"))),
        }
    }

    #[test]
    fn test_sample_matches_schema() -> Result<()> {
        parse_schema(&args("config.json", Some("config_schema.json")))
    }

    #[test]
    fn test_yaml_sample_parses() -> Result<()> {
        let cfg = CoordinationConfig::try_from(parse_wire::<wire::Config>(&args(
            "config.yaml",
            None,
        ))?)?;
        assert_eq!(cfg.prefix(), "/ISD1-AD10/bs");
        assert_eq!(cfg.shared_caches.len(), 2);
        Ok(())
    }

    #[test]
    fn test_cli_args() {
        let args = Args::parse_from(["zkcoord-cfg", "-p", "config.yaml", "-f", "internal"]);
        assert_eq!(args.format, Some(Format::Internal));
        assert!(args.schema.is_none());
    }
}
