//! Command-line view of the compiled-in protection tables.

use std::env;

use anyhow::{Context, Result, bail};

use amp_protect::clock::{StreamFormat, select_pll};
use amp_protect::compensation::{BATTERY_TABLE, TableVariant, ThermalTable};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: amp-cli <command>");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  tables [default|piezo]           Show thermal and battery tables");
        eprintln!("  pll <rate> <width> <channels>    Show the PLL entry for a bit-clock stream");
        std::process::exit(1);
    }

    let command = &args[1];

    match command.as_str() {
        "tables" => cmd_tables(args.get(2).map(String::as_str))?,
        "pll" => cmd_pll(&args[2..])?,
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn cmd_tables(variant: Option<&str>) -> Result<()> {
    let variant = match variant {
        Some(name) => name
            .parse::<TableVariant>()
            .with_context(|| format!("unknown table variant {name:?}"))?,
        None => TableVariant::default(),
    };

    println!("Thermal table ({variant}):");
    print!("{}", ThermalTable::new(variant).summary());

    println!();
    println!("Battery table:");
    for entry in BATTERY_TABLE.iter() {
        println!(
            "  {:<8} >= {:>4} mV  level {}  gain {}",
            entry.label, entry.min_mv, entry.level, entry.gain
        );
    }

    Ok(())
}

fn cmd_pll(args: &[String]) -> Result<()> {
    let [rate, width, channels] = args else {
        bail!("pll needs <rate> <width> <channels>");
    };
    let rate: u32 = rate.parse().context("rate must be a number")?;
    let width: u32 = width.parse().context("width must be a number")?;
    let channels: u32 = channels.parse().context("channels must be a number")?;

    // Wider slots carry 24 significant bits.
    let format = StreamFormat::new(rate, width.min(24), width, channels);
    format.validate()?;

    let selection = match format.bit_clock_hz() {
        Some(bit_clock) => {
            println!("Bit clock: {bit_clock} Hz");
            select_pll(bit_clock)
        }
        None => {
            println!("Bit clock: out of range");
            select_pll(0)
        }
    };
    println!(
        "PLL entry {}: {} -> {}{}",
        selection.index,
        selection.entry.input_name,
        selection.entry.output_name,
        if selection.exact { "" } else { " (default, no exact match)" }
    );
    let e = selection.entry;
    println!(
        "  POST_N=0x{:02X} N=0x{:02X} F1=0x{:02X} F2=0x{:02X} F3_P_CP=0x{:02X}",
        e.post_n, e.n, e.f1, e.f2, e.f3_p_cp
    );

    Ok(())
}
