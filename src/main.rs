use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rstsr::prelude::*;
use rstsr_ccsd_grad::mo2ao;
use rstsr_ccsd_grad::prelude::*;
use rstsr_ccsd_grad::util::tensor_from_npy;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct CliParser {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    #[clap(long = "mo_coeff", help = "Path to the npy file of MO coefficients (nao, nmo)")]
    mo_coeff_file: PathBuf,

    #[clap(long = "density", help = "Directory with doo, dvv and two-particle density blocks (npy)")]
    density_dir: PathBuf,

    #[clap(long = "max_memory", default_value_t = 2000.0, help = "Memory budget in MB")]
    max_memory: f64,

    #[clap(long = "blksize", help = "Force the block size of every pass")]
    blksize: Option<usize>,

    #[clap(long = "scratch", help = "Parent directory for scratch files")]
    scratch_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GradArgs {
    #[clap(short, long = "mol", help = "Path to the json file containing molecular data")]
    mol_file: String,

    #[clap(long = "mo_energy", help = "Path to the npy file of orbital energies")]
    mo_energy_file: PathBuf,

    #[clap(long = "amps", help = "Directory with t1, t2, l1, l2 (npy)")]
    amps_dir: PathBuf,

    #[clap(long = "eris", help = "Directory with fock and MO integral blocks (npy)")]
    eris_dir: PathBuf,

    #[clap(long = "atoms", value_delimiter = ',', help = "Atoms to evaluate, all if omitted")]
    atmlst: Option<Vec<usize>>,

    #[clap(long = "output", help = "Write the total gradient to this npy file")]
    output: Option<PathBuf>,

    #[clap(long = "cphf_max_cycle", default_value_t = 30)]
    cphf_max_cycle: usize,

    #[clap(long = "cphf_conv_tol", default_value_t = 1.0e-9)]
    cphf_conv_tol: f64,

    #[clap(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct Mo2aoArgs {
    #[clap(long = "dm1", help = "Path to the npy file of the MO one-particle density (nmo, nmo)")]
    dm1_file: PathBuf,

    #[clap(long = "output", help = "Directory receiving the dm2/<ic>.npy column blocks")]
    output: PathBuf,

    #[clap(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[clap(name = "grad", about = "Run the CCSD analytic gradient")]
    Grad(GradArgs),

    #[clap(name = "mo2ao", about = "Transform the two-particle density to packed AO pairs")]
    Mo2ao(Mo2aoArgs),
}

fn open_block(dir: &Path, name: &str) -> Result<BlockTensor> {
    BlockTensor::open_npy(dir.join(format!("{name}.npy"))).with_context(|| format!("cannot open block {name}"))
}

fn load_eris(dir: &Path, device: &DeviceTsr) -> Result<CCERIs> {
    Ok(CCERIs {
        fock: tensor_from_npy(dir.join("fock.npy"), device)?,
        oooo: open_block(dir, "oooo")?,
        ooov: open_block(dir, "ooov")?,
        ovoo: open_block(dir, "ovoo")?,
        oovv: open_block(dir, "oovv")?,
        ovov: open_block(dir, "ovov")?,
        ovvv: open_block(dir, "ovvv")?,
        vvvv: open_block(dir, "vvvv")?,
    })
}

fn load_amps(dir: &Path, device: &DeviceTsr) -> Result<CCAmplitudes> {
    Ok(CCAmplitudes {
        t1: tensor_from_npy(dir.join("t1.npy"), device)?,
        t2: tensor_from_npy(dir.join("t2.npy"), device)?,
        l1: tensor_from_npy(dir.join("l1.npy"), device)?,
        l2: tensor_from_npy(dir.join("l2.npy"), device)?,
    })
}

fn load_d2(dir: &Path) -> Result<CCDensity2> {
    Ok(CCDensity2 {
        dovov: open_block(dir, "dovov")?,
        dvvvv: open_block(dir, "dvvvv")?,
        doooo: open_block(dir, "doooo")?,
        doovv: open_block(dir, "doovv")?,
        dovvo: open_block(dir, "dovvo")?,
        dovvv: open_block(dir, "dovvv")?,
        dooov: open_block(dir, "dooov")?,
    })
}

fn grad_flags(common: &CommonArgs) -> GradFlagsBuilder {
    let mut builder = GradFlagsBuilder::default();
    builder.max_memory(common.max_memory).blksize(common.blksize).scratch_dir(common.scratch_dir.clone());
    builder
}

fn run_grad(args: GradArgs) -> Result<()> {
    let device = DeviceTsr::default();
    let time = std::time::Instant::now();
    let flags = grad_flags(&args.common)
        .atmlst(args.atmlst.clone())
        .cphf_max_cycle(args.cphf_max_cycle)
        .cphf_conv_tol(args.cphf_conv_tol)
        .build()?;
    let integrals = CIntGradIntegrals::from_json(&args.mol_file).with_max_memory(flags.max_memory);

    let amps = load_amps(&args.amps_dir, &device)?;
    let mo_coeff = tensor_from_npy(&args.common.mo_coeff_file, &device)?;
    let mo_energy = tensor_from_npy(&args.mo_energy_file, &device)?;
    let info = CCSDGradInfo::from_amplitudes(mo_coeff, mo_energy, &amps)?;
    let eris = load_eris(&args.eris_dir, &device)?;
    let density = PrecomputedDensity::from_dir(&args.common.density_dir)?;
    let cphf = DIISCPHFSolver::from(&flags);
    let results = ccsd_grad_kernel(&info, &amps, &eris, &density, &integrals, &cphf, &flags)?;
    if !results.cphf_converged {
        println!("Warning: CPHF not converged after {} cycles", results.cphf_niter);
    }

    let de_total = results.de_total();
    println!("Total CCSD gradient (electronic + nuclear):");
    for (k, &ia) in results.atmlst.iter().enumerate() {
        println!(
            "{ia} {}  {:15.9}  {:15.9}  {:15.9}",
            integrals.atom_symbol(ia),
            de_total[[k, 0]],
            de_total[[k, 1]],
            de_total[[k, 2]]
        );
    }
    if let Some(output) = &args.output {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        rstsr_ccsd_grad::scratch::NpyTensor::create_from(output, &de_total.view())?;
        println!("Gradient written to {}", output.display());
    }
    println!("Elapsed time for CCSD gradient: {:.2?}", time.elapsed());
    Ok(())
}

fn run_mo2ao(args: Mo2aoArgs) -> Result<()> {
    let device = DeviceTsr::default();
    let time = std::time::Instant::now();
    let mo_coeff = tensor_from_npy(&args.common.mo_coeff_file, &device)?;
    let dm1 = tensor_from_npy(&args.dm1_file, &device)?;
    let d2 = load_d2(&args.common.density_dir)?;
    let flags = grad_flags(&args.common).build()?;

    let out = ScratchStore::open_at(&args.output)?;
    let dm2 = mo2ao::rdm2_mo2ao(&d2, &dm1, &mo_coeff, &flags, &out)?;
    println!("AO density (nao_pair = {}) written in {} column blocks:", dm2.nao_pair(), dm2.blocks.len());
    for (c0, c1, dset) in &dm2.blocks {
        println!("    columns {c0}..{c1}: {}", dset.path.display());
    }
    println!("Elapsed time for MO->AO transformation: {:.2?}", time.elapsed());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliParser::parse();

    match args.command {
        Command::Grad(args) => run_grad(args),
        Command::Mo2ao(args) => run_mo2ao(args),
    }
}
