//! STRATA - LSM Segment Engine
//! Interactive shell over a `String -> Option<String>` engine.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use strata::{
    Config, EngineOptions, IteratorMode, Maintainer, OptionDeletionPolicy, Strata, StrataError,
};

type Engine = Strata<String, Option<String>>;

fn open_engine() -> strata::Result<Engine> {
    let data_dir = std::env::var("STRATA_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let config = Config::new(data_dir).with_mutable_segment_max_item_count(10_000);
    let options = EngineOptions::new(config, Arc::new(OptionDeletionPolicy))?;
    Strata::open(options)
}

fn scan(engine: &Engine, reverse: bool) -> strata::Result<usize> {
    let iterator = if reverse {
        engine.create_reverse_iterator(IteratorMode::NoRefresh)?
    } else {
        engine.create_iterator(IteratorMode::NoRefresh)?
    };
    let mut count = 0;
    for entry in iterator {
        let (key, value) = entry?;
        println!("  {} -> {}", key, value.unwrap_or_default());
        count += 1;
    }
    Ok(count)
}

fn info(engine: &Engine) -> strata::Result<()> {
    println!("  Entries:          {}", engine.count()?);
    println!(
        "  Segment zero:     #{} ({} entries)",
        engine.segment_zero_id(),
        engine.segment_zero_len()
    );
    println!(
        "  Read-only queue:  {} segments, {} entries",
        engine.read_only_segments_count(),
        engine.read_only_segments_record_count()
    );
    println!(
        "  Disk segment:     #{} ({} records, {} parts)",
        engine.disk_segment_id(),
        engine.disk_segment_len(),
        engine.disk_segment_part_ids().len()
    );
    println!(
        "  Bottom segments:  {} ({} records)",
        engine.bottom_segments_count(),
        engine.bottom_segments_record_count()
    );
    println!("  Op index:         {}", engine.op_index());
    Ok(())
}

fn execute(engine: &Engine, parts: &[&str]) -> strata::Result<bool> {
    match parts[0].to_lowercase().as_str() {
        "set" | "put" => {
            if parts.len() < 3 {
                println!("  usage: set <key> <value>");
                return Ok(true);
            }
            engine.upsert(parts[1].to_string(), Some(parts[2..].join(" ")))?;
            println!("  OK");
        }
        "get" => {
            if parts.len() < 2 {
                println!("  usage: get <key>");
                return Ok(true);
            }
            match engine.try_get(&parts[1].to_string())? {
                Some(Some(value)) => println!("  \"{}\"", value),
                _ => println!("  (nil)"),
            }
        }
        "del" | "delete" => {
            if parts.len() < 2 {
                println!("  usage: del <key>");
                return Ok(true);
            }
            engine.delete(parts[1].to_string())?;
            println!("  OK (deleted)");
        }
        "scan" | "list" | "rscan" => {
            let count = scan(engine, parts[0] == "rscan")?;
            if count == 0 {
                println!("  (empty)");
            } else {
                println!("  ({} entries)", count);
            }
        }
        "flush" => {
            if engine.move_segment_zero_forward()? {
                println!("  Segment zero moved to the read-only queue");
            } else {
                println!("  Segment zero is empty");
            }
        }
        "merge" => println!("  {:?}", engine.merge()),
        "info" | "stats" => info(engine)?,
        "metrics" => println!("{}", engine.metrics().snapshot()),
        "help" | "?" => print_help(),
        "exit" | "quit" | "q" => {
            println!("  Shutting down STRATA...");
            return Ok(false);
        }
        _ => println!("  Unknown command: '{}'. Type 'help' for a list.", parts[0]),
    }
    Ok(true)
}

fn print_help() {
    for (usage, what) in [
        ("set <key> <value>", "upsert a value"),
        ("get <key>", "read the newest live value"),
        ("del <key>", "write a tombstone"),
        ("scan | rscan", "iterate in key order, or reversed"),
        ("flush", "freeze segment zero into the read-only queue"),
        ("merge", "merge the read-only queue into the disk segment"),
        ("info", "segment topology"),
        ("metrics", "engine counters"),
        ("exit", "wait for background merges and quit"),
    ] {
        println!("  {:<20}{}", usage, what);
    }
}

fn main() {
    env_logger::init();

    println!("STRATA segment engine (type `help` for commands)");

    let engine = match open_engine() {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("strata: cannot open engine: {}", err);
            std::process::exit(1);
        }
    };
    let maintainer = Maintainer::new(&engine);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("strata> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                eprintln!("[ERROR] {}", StrataError::from(err));
                break;
            }
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        match execute(&engine, &parts) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("  ERROR: {}", err),
        }
    }

    for result in maintainer.complete_running_tasks() {
        log::info!("Background merge finished: {:?}", result);
    }
}
