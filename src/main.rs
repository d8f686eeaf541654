use std::{env, process::exit};
use tracing::info;
use tracing_subscriber::EnvFilter;
use weft::{Assembler, FieldAddress, Register};

/// Record updated by the generated code.
#[repr(C)]
struct Point {
    x: i64,
    y: i64,
}

struct Opts {
    /// Whether to print the emitted code.
    dump_code: bool,

    /// Initial value of the field.
    field: i64,

    /// Value added to the field.
    add: i64,
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    let opts = match parse_opts(&args) {
        Some(opts) => opts,
        None => {
            eprintln!("usage: weft [--dump-code] [--field <n>] [--add <n>]");
            exit(1);
        }
    };

    if let Err(err) = run(&opts) {
        eprintln!("error: {}", err);
        exit(1);
    }
}

fn run(opts: &Opts) -> weft::Result<()> {
    let mut point = Box::new(Point {
        x: 100,
        y: opts.field,
    });
    let point_addr = &mut *point as *mut Point;

    // RAX = &point; [RAX + offsetof(y)] += add; ret
    let y_addr = FieldAddress::field(Register::RAX, std::mem::offset_of!(Point, y) as i32);
    let mut asm = Assembler::new();
    asm.emit_mov_imm64(Register::RAX, point_addr as i64)?;
    asm.emit_add_mi(&y_addr, opts.add)?;
    asm.emit_ret()?;

    if opts.dump_code {
        print_code(asm.code());
    }

    let code = asm.compile()?;
    info!("Running {} bytes of generated code", code.len());
    let func: extern "C" fn() = unsafe { std::mem::transmute(code.entry()) };
    func();

    let point = unsafe { point_addr.read_volatile() };
    println!("x = {}, y = {}", point.x, point.y);
    Ok(())
}

fn print_code(code: &[u8]) {
    for (i, chunk) in code.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {:08x}: {}", i * 16, hex.join(" "));
    }
}

fn parse_opts(args: &[String]) -> Option<Opts> {
    let mut opts = Opts {
        dump_code: false,
        field: 100,
        add: 1000,
    };
    let mut i = 1; // Skip program name
    while i < args.len() {
        match args[i].as_str() {
            "--dump-code" => opts.dump_code = true,
            "--field" => {
                i += 1;
                opts.field = args.get(i)?.parse().ok()?;
            }
            "--add" => {
                i += 1;
                opts.add = args.get(i)?.parse().ok()?;
            }
            _ => return None,
        }
        i += 1;
    }
    Some(opts)
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
