use std::path::PathBuf;

use arbitrary::Unstructured;
use clap::Parser;
use lcra::fuzzing::func::Options;
use lcra::interp::{self, Inputs};
use lcra::{Func, MachineEnv, Output, RegallocOptions};

#[derive(Parser)]
/// Tool for testing lcra.
struct Args {
    /// Print the input function and the result of register allocation.
    #[clap(short = 'v')]
    verbose: bool,

    /// Input file containing a bincode-encoded Func.
    #[clap(required_unless_present = "generate")]
    input: Option<PathBuf>,

    /// Allocate a random function built from this seed instead.
    #[clap(long)]
    generate: Option<u64>,

    /// Skip the pressure scheduler.
    #[clap(long)]
    no_schedule: bool,

    /// Shrink the register file to force spilling.
    #[clap(long)]
    stress_spill: bool,

    /// Allocate into a flat file of this many registers. Generated
    /// functions only end in a blend when the file reaches r60.
    #[clap(long)]
    width: Option<usize>,

    /// Do not try the reduced register file first.
    #[clap(long)]
    no_reduced: bool,

    /// Run the checker and compare interpreted behaviour before and
    /// after allocation.
    #[clap(long)]
    check: bool,
}

fn generate(seed: u64, opts: &Options) -> Func {
    // xorshift keeps the generated function stable across releases of
    // any random number crate.
    let mut state = seed | 1;
    let bytes: Vec<u8> = (0..1 << 16)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect();
    let mut u = Unstructured::new(&bytes);
    Func::arbitrary_with_options(&mut u, opts)
        .expect("could not generate a function")
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let mut function = match (args.generate, &args.input) {
        (Some(seed), _) => {
            // The fragment epilogue pins r48 and r60, which a narrow
            // file does not have.
            let opts = Options {
                fragment_output: args.width.map_or(true, |width| width > 60),
                ..Options::default()
            };
            generate(seed, &opts)
        }
        (None, Some(path)) => {
            let input = std::fs::read(path).expect("could not read input file");
            bincode::deserialize(&input).expect("could not deserialize input file")
        }
        (None, None) => unreachable!(),
    };

    if args.verbose {
        println!("Input function:\n{function}");
    }

    let mut env = match args.width {
        Some(width) => MachineEnv::with_width(width),
        None => MachineEnv::bifrost(),
    };
    if args.no_reduced {
        env.reduced_regs = None;
    }

    let options = RegallocOptions {
        schedule: !args.no_schedule,
        stress_spilling: args.stress_spill,
        check: args.check,
        verbose_log: true,
        ..RegallocOptions::default()
    };
    let before = args.check.then(|| interp::run(&function, &Inputs::default()));
    let output = match lcra::run(&mut function, &env, &options) {
        Ok(output) => output,
        Err(e) => {
            panic!("Register allocation failed: {e:#?}");
        }
    };

    if args.verbose {
        print_output(&function, &output);
    }

    if let Some(Ok(before)) = before {
        let inputs = Inputs {
            step_limit: usize::MAX,
            ..Inputs::default()
        };
        let after = interp::run(&function, &inputs).expect("allocated program failed to run");
        if !before.same_effects(&after) {
            panic!("Allocation changed behaviour:\n{before:#?}\n{after:#?}");
        }
    }
}

fn print_output(func: &Func, output: &Output) {
    print!("Register allocation result: {{\n");
    print!("{func}");
    print!("}}\n");
    print!(
        "work registers: {}, scratch bytes: {}\n",
        output.work_reg_count, output.scratch_size
    );
    print!("{:#?}\n", output.stats);
}
