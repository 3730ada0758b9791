use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Args;
use etl_core::dates::format_date;
use etl_core::overseer_options::OverseerOptions;
use serde_json::{json, Map, Value};

#[derive(Args)]
pub struct ChunksArgs {
    #[arg(long, short = 's')]
    start_date: Option<String>,

    #[arg(long, short = 'e')]
    end_date: Option<String>,

    #[arg(long, short = 'n')]
    number_of_days: Option<i64>,

    #[arg(long, short = 'k')]
    chunk_size_days: Option<u32>,
}

pub fn run(args: ChunksArgs, json: bool) -> anyhow::Result<()> {
    let mut map = Map::new();
    if let Some(s) = args.start_date {
        map.insert("start-date".into(), Value::String(s));
    }
    if let Some(e) = args.end_date {
        map.insert("end-date".into(), Value::String(e));
    }
    if let Some(n) = args.number_of_days {
        map.insert("number-of-days".into(), n.into());
    }
    if let Some(k) = args.chunk_size_days {
        map.insert("chunk-size-days".into(), k.into());
    }
    let options = OverseerOptions::from_map(&map).context("invalid date window")?;

    if json {
        return print_json(&json!({
            "start_date": format_date(&options.start_date()),
            "end_date": format_date(&options.end_date()),
            "chunks": options.chunks(),
        }));
    }
    let rows = options
        .chunks()
        .iter()
        .enumerate()
        .map(|(i, c)| vec![(i + 1).to_string(), format_date(&c.start), format_date(&c.end)])
        .collect();
    print_table(&["#", "START", "END"], rows);
    Ok(())
}
