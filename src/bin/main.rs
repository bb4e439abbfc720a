use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use log::info;

use rust_sav::{vcf, BoundingPolicy, IndexedReader, Reader, Region};

fn main() -> Result<()> {
    env_logger::init();
    let args = std::env::args().collect_vec();
    if args.len() < 2 {
        bail!("usage: {} <file.sav> [stat|export] [region] [policy]", args[0]);
    }
    let path = &args[1];
    let command = args.get(2).map(String::as_str).unwrap_or("stat");

    match command {
        "stat" => {
            let reader = Reader::from_path(path).context("failed to open file")?;
            println!("samples:\t{}", reader.samples().len());
            println!(
                "phasing:\t{}",
                reader.header().phasing()
            );
            println!("compressed:\t{}", reader.is_compressed());
            let mut per_contig: BTreeMap<String, u64> = BTreeMap::new();
            let mut total = 0u64;
            for record in reader {
                let record = record?;
                *per_contig.entry(record.chrom().clone()).or_insert(0) += 1;
                total += 1;
            }
            for (contig, count) in &per_contig {
                println!("{}\t{}", contig, count);
            }
            println!("records:\t{}", total);
        }
        "export" => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            match args.get(3) {
                Some(region_text) => {
                    let region = Region::parse(region_text)
                        .with_context(|| format!("bad region: {}", region_text))?;
                    let policy: BoundingPolicy = args
                        .get(4)
                        .map(|p| p.parse())
                        .transpose()
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    let mut reader =
                        IndexedReader::from_path(path).context("failed to open file")?;
                    info!("index present: {}", reader.has_index());
                    let header = reader.header().clone();
                    for record in reader.query(&region, policy)? {
                        vcf::write_record_line(&record?, &header, &mut out)?;
                    }
                }
                None => {
                    let reader = Reader::from_path(path).context("failed to open file")?;
                    let header = reader.header().clone();
                    for record in reader {
                        vcf::write_record_line(&record?, &header, &mut out)?;
                    }
                }
            }
        }
        other => bail!("unknown command: {}", other),
    }
    Ok(())
}
