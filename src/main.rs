//! Kernel generator CLI
//!
//! Usage:
//!   gemmgen "fmadd(c, a, b)" --rows 4 --lanes 24 --dims 64x64x64
//!   gemmgen --bytecode 00010100101000010001 --kernel-type packed --pack 8
//!   gemmgen "add(mul(a, b), const[0])" --constant 0.5 --json

use clap::Parser as ClapParser;
use colored::Colorize;

use gemm_kernelgen::{
    assemble, generate, Bytecode, KernelProgram, KernelSpec, LayoutKind, VarArgKind,
};

#[derive(ClapParser, Debug)]
#[command(name = "gemmgen")]
#[command(author = "Kernel Codegen Team")]
#[command(version = "0.1.0")]
#[command(about = "Generates blocked SIMD matrix kernels from tile-expression bytecode")]
struct Args {
    /// Kernel expression to assemble (e.g., "fmadd(c, a, b)")
    #[arg(value_name = "EXPR")]
    expression: Option<String>,

    /// Raw wire bytecode as a binary string of 5-bit tokens
    #[arg(short = 'b', long = "bytecode")]
    bytecode: Option<String>,

    /// Layout strategy: plain, tleft, tright, packed, ipacked
    #[arg(short = 't', long = "kernel-type", default_value = "plain", value_parser = parse_layout)]
    kernel_type: LayoutKind,

    /// M-tile length in output rows
    #[arg(short = 'r', long = "rows", default_value = "4")]
    rows: usize,

    /// N-tile width in raw SIMD lanes
    #[arg(short = 'l', long = "lanes", default_value = "8")]
    lanes: usize,

    /// Matrix dimensions as MxKxN
    #[arg(short = 'd', long = "dims", default_value = "64x64x64", value_parser = parse_dims)]
    dims: (usize, usize, usize),

    /// Tile origin as i,k,j
    #[arg(long = "pos", default_value = "0,0,0", value_parser = parse_pos)]
    pos: (usize, usize, usize),

    /// K-panel length (defaults to the full K dimension)
    #[arg(short = 'p', long = "panel")]
    panel: Option<usize>,

    /// Constant argument (repeatable)
    #[arg(short = 'c', long = "constant")]
    constants: Vec<f64>,

    /// Variable-argument descriptor: unused, row, col, cell (repeatable)
    #[arg(long = "var", value_parser = parse_var_kind)]
    vars: Vec<VarArgKind>,

    /// Pack factor for packed layouts
    #[arg(long = "pack", default_value = "0")]
    pack: usize,

    /// Alignment offset of the packed A buffer
    #[arg(long = "a-align", default_value = "0")]
    a_align: usize,

    /// Alignment offset of the packed B buffer
    #[arg(long = "b-align", default_value = "0")]
    b_align: usize,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_layout(s: &str) -> Result<LayoutKind, String> {
    match s {
        "plain" | "0" => Ok(LayoutKind::Plain),
        "tleft" | "1" => Ok(LayoutKind::TransposedLeft),
        "tright" | "2" => Ok(LayoutKind::TransposedRight),
        "packed" | "4" => Ok(LayoutKind::Packed),
        "ipacked" | "5" => Ok(LayoutKind::InterleavedPacked),
        other => Err(format!("unknown kernel type: {}", other)),
    }
}

fn parse_dims(s: &str) -> Result<(usize, usize, usize), String> {
    let parts: Vec<&str> = s.split('x').collect();
    if parts.len() != 3 {
        return Err(format!("expected MxKxN, got: {}", s));
    }
    let mut dims = [0usize; 3];
    for (slot, part) in dims.iter_mut().zip(&parts) {
        *slot = part
            .parse::<usize>()
            .map_err(|_| format!("invalid dimension: {}", part))?;
    }
    Ok((dims[0], dims[1], dims[2]))
}

fn parse_pos(s: &str) -> Result<(usize, usize, usize), String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected i,k,j, got: {}", s));
    }
    let mut pos = [0usize; 3];
    for (slot, part) in pos.iter_mut().zip(&parts) {
        *slot = part
            .parse::<usize>()
            .map_err(|_| format!("invalid position: {}", part))?;
    }
    Ok((pos[0], pos[1], pos[2]))
}

fn parse_var_kind(s: &str) -> Result<VarArgKind, String> {
    match s {
        "unused" | "0" => Ok(VarArgKind::Unused),
        "row" | "1" => Ok(VarArgKind::RowBroadcast),
        "col" | "2" => Ok(VarArgKind::ColVector),
        "cell" | "3" => Ok(VarArgKind::PerCell),
        other => Err(format!("unknown variable-argument kind: {}", other)),
    }
}

fn main() {
    let args = Args::parse();

    // Assemble or decode the kernel body
    let bytecode = if let Some(bits) = &args.bytecode {
        match Bytecode::from_bits(bits) {
            Ok(bc) => bc,
            Err(e) => {
                eprintln!("{}: {}", "Bytecode error".red(), e);
                std::process::exit(1);
            }
        }
    } else if let Some(expr) = &args.expression {
        match assemble(expr) {
            Ok(bc) => bc,
            Err(e) => {
                eprintln!("{}: {}", "Assembler error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("{}: provide an expression or --bytecode", "Error".red());
        std::process::exit(1);
    };

    // Build the kernel spec
    let mut spec = match KernelSpec::new(args.kernel_type, args.rows, args.lanes, args.dims) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}", "Spec error".red(), e);
            std::process::exit(1);
        }
    };
    spec.i_pos = args.pos.0;
    spec.k_pos = args.pos.1;
    spec.j_pos = args.pos.2;
    if let Some(panel) = args.panel {
        spec.k_panel = panel;
    }
    spec.const_args = args.constants.clone();
    spec.var_args = args.vars.clone();
    spec.pack_factor = args.pack;
    spec.a_align = args.a_align;
    spec.b_align = args.b_align;

    if args.verbose {
        println!("{}", "SIMD GEMM Kernel Generator".bold().blue());
        println!("{}", "=".repeat(30));
        println!();
        println!("{}: {}", "Bytecode".green(), bytecode.to_bits());
        println!(
            "{}: {:?}, {} rows x {} lanes",
            "Layout".green(),
            spec.layout,
            spec.a_len,
            args.lanes
        );
        println!(
            "{}: {}x{}x{} at ({}, {}, {})",
            "Dims".green(),
            spec.m_length,
            spec.k_length,
            spec.n_length,
            spec.i_pos,
            spec.k_pos,
            spec.j_pos
        );
        println!();
    }

    let program = match generate(&bytecode, &spec) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", "Generation error".red(), e);
            std::process::exit(1);
        }
    };

    if args.json_output {
        match program.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        print_program(&program, args.verbose);
    }
}

fn print_program(program: &KernelProgram, verbose: bool) {
    println!("{}", "Generation Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    println!("{}: {:?}", "Layout".cyan(), program.layout);
    match program.tile {
        Some(tile) => println!(
            "{}: {} rows x {} vectors",
            "Tile".cyan(),
            tile.rows,
            tile.vecs
        ),
        None => println!("{}: {}", "Tile".cyan(), "none (no tile fit)".yellow()),
    }
    println!("{}: {}", "Instructions".cyan(), program.insts.len());
    println!();

    if verbose || program.insts.len() <= 64 {
        println!("{}", "Instruction Listing".bold().yellow());
        println!("{}", "-".repeat(50));
        for (i, inst) in program.insts.iter().enumerate() {
            println!("{:4}:  {}", i, inst);
        }
    } else {
        println!("({} instructions, use -v for the listing)", program.insts.len());
    }
}
