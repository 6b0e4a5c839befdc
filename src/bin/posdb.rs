use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use kira_posdb::*;
use needletail::parse_fastx_file;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Build and inspect k-mer position indexes.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Log progress at info level
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an index from FASTA/FASTQ(.gz)
    Build {
        /// Input sequences
        #[arg(short, long)]
        input: PathBuf,

        /// Output index path
        #[arg(short, long)]
        output: PathBuf,

        /// K-mer length (2..=32)
        #[arg(short = 'k', long)]
        k: u32,

        /// Keep one mer, then skip this many
        #[arg(long, default_value_t = 0)]
        skip: u32,

        /// Index the smaller of each mer and its reverse complement
        #[arg(long, default_value_t = false)]
        canonical: bool,

        /// Table size in bits (default: sized from the input)
        #[arg(short = 't', long)]
        table_bits: Option<u32>,

        /// Prepare lookups with up to this many substitutions
        #[arg(short = 'm', long, default_value_t = 0)]
        max_mismatch: u32,

        /// Memory ceiling in MiB for table sizing (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max_memory: u64,

        /// Drop mers seen fewer times
        #[arg(long, default_value_t = 0)]
        min_count: u64,

        /// Drop mers seen more times
        #[arg(long)]
        max_count: Option<u64>,
    },
    /// Print geometry and counters without loading the bulk arrays
    Stats {
        /// Index path
        index: PathBuf,
    },
    /// Look up k-mers given as sequences
    Query {
        /// Index path
        #[arg(short, long)]
        index: PathBuf,

        /// Mer skip the index was built with
        #[arg(long, default_value_t = 0)]
        skip: u32,

        /// Allowed substitutions
        #[arg(short = 'm', long, default_value_t = 0)]
        mismatches: u32,

        /// K-mers to look up (all the same length as the index)
        #[arg(required = true)]
        kmers: Vec<String>,
    },
}

fn init_logger(verbose: bool) {
    START_TIME.set(Instant::now()).ok();

    let level = if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format(|buf, record| {
            let elapsed = START_TIME.get().map(|t| t.elapsed()).unwrap_or_default();
            let secs = elapsed.as_secs();
            writeln!(
                buf,
                "[{:02}:{:02}:{:02}] {}: {}",
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60,
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .init();
}

fn read_sequences(path: &PathBuf) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut reader = parse_fastx_file(path)
        .with_context(|| format!("Could not open {}", path.display()))?;
    let mut seqs = Vec::new();
    while let Some(record) = reader.next() {
        let rec = record.with_context(|| format!("Bad record in {}", path.display()))?;
        seqs.push(rec.seq().into_owned());
    }
    Ok(seqs)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    match args.command {
        Command::Build {
            input,
            output,
            k,
            skip,
            canonical,
            table_bits,
            max_mismatch,
            max_memory,
            min_count,
            max_count,
        } => {
            if !(2..=MAX_MER_SIZE).contains(&k) {
                bail!("k must be 2..={MAX_MER_SIZE}");
            }
            let seqs = read_sequences(&input)?;
            let stream = SeqMerStream::new(seqs, k as usize, canonical)?;

            let mut cfg = BuildConfig::default()
                .mer_skip(skip)
                .max_mismatch(max_mismatch)
                .max_memory_mb(max_memory)
                .min_count(min_count)
                .max_count(max_count.unwrap_or(u64::MAX))
                .verbose(args.verbose);
            if let Some(t) = table_bits {
                cfg = cfg.table_bits(t);
            }

            let db = build_position_db(&stream, k, &cfg)?;
            db.save_state(&output)
                .with_context(|| format!("Could not write {}", output.display()))?;
            let counts = db.counts();
            eprintln!(
                "Built posdb: k={}, tableBits={}, mers={}, distinct={}, unique={}, maxMismatch={}",
                db.mer_size(),
                db.table_bits(),
                counts.mers,
                counts.distinct,
                counts.unique,
                db.max_mismatch()
            );
        }
        Command::Stats { index } => {
            let db = PositionDb::load_state(&index, args.verbose, false)?;
            let stdout = std::io::stdout();
            db.print_state(&mut stdout.lock())?;
        }
        Command::Query {
            index,
            skip,
            mismatches,
            kmers,
        } => {
            let k = kmers[0].len() as u32;
            let db = PositionDb::open(&index, k, skip, mismatches, true)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let mut posn = Vec::new();
            for kmer in &kmers {
                let Some(code) = encode_kmer(kmer.as_bytes()).filter(|_| kmer.len() as u32 == k)
                else {
                    bail!("{kmer} is not a valid {k}-mer");
                };
                if mismatches == 0 {
                    db.get_exact(code, &mut posn);
                } else {
                    db.get_up_to_n_mismatches(code, mismatches, &mut posn);
                }
                posn.sort_unstable();
                let list: Vec<String> = posn.iter().map(|p| p.to_string()).collect();
                writeln!(out, "{kmer}\t{}\t{}", posn.len(), list.join(","))?;
            }
        }
    }

    Ok(())
}
