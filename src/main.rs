use std::error::Error;

use clap::Parser;
use memmap2::Mmap;

use btfenc::elf::ElfReader;
use btfenc::encoder::{EncoderConfig, EncoderSession};
use btfenc::types::Btf;

#[derive(Parser)]
#[command(name = "btfenc", about = "Encode BTF type info from an object file's DWARF data")]
struct Cli {
    /// Object file carrying DWARF debug info and a symbol table
    object_file: String,

    /// Ignore invalid symbol names and void-typed per-CPU variables
    /// instead of failing
    #[arg(long)]
    btf_encode_force: bool,

    /// Print encoding progress details
    #[arg(short, long)]
    verbose: bool,

    /// Do not encode per-CPU variables
    #[arg(long)]
    skip_encoding_btf_vars: bool,

    /// Continue type numbering after the .BTF section of this file
    #[arg(long)]
    btf_base: Option<String>,

    /// Where to write the BTF image (default: <object_file>.btf)
    #[arg(short, long)]
    output: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();

    let file = std::fs::File::open(&args.object_file)?;
    let file = unsafe { Mmap::map(&file) }?;
    let elf = ElfReader::parse(&file)?;

    let base = match &args.btf_base {
        Some(path) => {
            let base_file = std::fs::File::open(path)?;
            let base_file = unsafe { Mmap::map(&base_file) }?;
            Some(Btf::from_elf_data(&base_file)?)
        }
        None => None,
    };

    let cfg = EncoderConfig {
        verbose: args.verbose,
        force: args.btf_encode_force,
        skip_encoding_vars: args.skip_encoding_btf_vars,
    };

    let cus = btfenc::dwarf::load_cus(elf.object(), &args.object_file)?;
    let mut session = EncoderSession::new(&elf, &args.object_file, cfg, base.as_ref())?;
    for cu in &cus {
        session.encode_cu(cu)?;
    }
    let image = session.finalize()?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| format!("{}.btf", args.object_file));
    std::fs::write(&output, &image)?;
    if args.verbose {
        println!("Wrote {} bytes of BTF to {}", image.len(), output);
    }
    Ok(())
}
