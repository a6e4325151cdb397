use clap::{Arg, Command};
use csv_fk_ingest::{Identifier, IngestConfig};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

const ITEMS: [&str; 8] = [
    "Chair", "Table", "Lamp", "Shirt", "Keyboard", "Gloves", "Towels", "Shoes",
];

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write an orders CSV to stdout, some rows pointing at unknown customers")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("customers")
                .long("customers")
                .help("File with one known customer id per line (e.g. from `ingest seed-parents`)")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("orphan-every")
                .long("orphan-every")
                .help("Every Nth row gets a customer id that does not exist (0 = never)")
                .value_parser(clap::value_parser!(u64))
                .default_value("10"),
        )
        .arg(Arg::new("delim").long("delim").default_value(","))
        .get_matches();

    let rows: u64 = *matches.get_one("rows").unwrap();
    let orphan_every: u64 = *matches.get_one("orphan-every").unwrap();
    let delim = matches.get_one::<String>("delim").unwrap();
    let path = matches.get_one::<PathBuf>("customers").unwrap();

    let customers = fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.parse::<Identifier>())
        .collect::<Result<Vec<_>, _>>()?;
    if customers.is_empty() {
        anyhow::bail!("{} has no customer ids", path.display());
    }

    let mut out = io::BufWriter::new(io::stdout().lock());

    let header = IngestConfig::default().format.columns.join(delim);
    writeln!(&mut out, "{header}")?;

    for i in 0..rows {
        let customer = if orphan_every > 0 && i % orphan_every == 0 {
            Identifier::new_random()
        } else {
            customers[(i as usize) % customers.len()]
        };
        let item = ITEMS[(i as usize) % ITEMS.len()];
        writeln!(
            &mut out,
            "{order}{delim}{customer}{delim}{item}{delim}{qty}",
            order = Identifier::new_random(),
            qty = i % 100 + 1,
        )?;
        if i % 10_000 == 0 {
            out.flush()?;
        } // keep buffers moving on huge runs
    }

    out.flush()?;
    Ok(())
}
