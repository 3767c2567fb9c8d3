use std::fs::File;
use std::io::{Read, Write};

use i8086_asm::bytesrc::ByteWindow;
use i8086_asm::decode::{decode_next, update_ctx, DecoderContext};
use i8086_asm::print::Printer;
use i8086_asm::sim::{SimOutcome, Simulator};
use i8086_asm::table::InstructionTable;

fn main() {
    let mut args = std::env::args();
    let prg_name = args.next().unwrap();

    let usage = || -> ! {
        eprintln!("USAGE: {prg_name} (disasm|sim) <input-file> [-o <output-file>]");
        std::process::exit(1)
    };

    let Some(mode) = args.next() else { usage() };
    let Some(input_path) = args.next() else { usage() };

    let mut output_path = None::<String>;
    while let Some(arg) = args.next() {
        match &*arg {
            "-o" => {
                output_path = Some(args.next().unwrap_or_else(|| usage()));
            }
            _ => usage(),
        }
    }

    let mut file = File::open(&input_path).unwrap_or_else(|e| {
        eprintln!("{prg_name}: failed to open {input_path}: {e}");
        std::process::exit(1);
    });
    let mut image = Vec::new();
    file.read_to_end(&mut image).unwrap_or_else(|e| {
        eprintln!("{prg_name}: failed to read {input_path}: {e}");
        std::process::exit(1);
    });

    let code = match &*mode {
        "disasm" => run_disasm(&prg_name, &input_path, &image, output_path.as_deref()),
        "sim" => run_sim(&prg_name, &image, output_path.as_deref()),
        _ => usage(),
    };
    std::process::exit(code);
}

fn write_output(prg_name: &str, output_path: Option<&str>, text: &str) -> i32 {
    match output_path {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                eprintln!("{prg_name}: failed to write {path}: {e}");
                return 1;
            }
        }
        None => {
            let _ = std::io::stdout().write_all(text.as_bytes());
        }
    }
    0
}

fn run_disasm(prg_name: &str, input_path: &str, image: &[u8], output_path: Option<&str>) -> i32 {
    let table = InstructionTable::build();
    let window = ByteWindow::new(image);
    let mut ctx = DecoderContext::new();
    let mut printer = Printer::new(String::new());
    printer.write_line(&format!(";; {input_path} disassembly ;;")).ok();
    printer.write_line("bits 16").ok();

    let mut offset = 0usize;
    let mut had_error = false;
    while offset < window.len() {
        let instr = decode_next(&window, offset, &table, &ctx);
        if instr.is_invalid() {
            eprintln!("{prg_name}: unrecognized opcode at offset {offset}");
            had_error = true;
            break;
        }
        printer.write_instruction(&instr).expect("String writer never fails");
        printer.write_line("").expect("String writer never fails");
        update_ctx(&instr, &mut ctx);
        offset += instr.size_bytes as usize;
    }

    let text = printer.into_inner();
    let write_code = write_output(prg_name, output_path, &text);
    if had_error {
        1
    } else {
        write_code
    }
}

fn run_sim(prg_name: &str, image: &[u8], output_path: Option<&str>) -> i32 {
    let table = InstructionTable::build();
    let mut sim = Simulator::new();
    sim.load(image, 0);

    let mut ctx = DecoderContext::new();
    let mut offset = 0usize;
    let mut had_error = false;
    loop {
        if offset >= image.len() {
            break;
        }
        let window = ByteWindow::new(image);
        let instr = decode_next(&window, offset, &table, &ctx);
        if instr.is_invalid() {
            eprintln!("{prg_name}: unrecognized opcode at offset {offset}, halting");
            had_error = true;
            break;
        }
        update_ctx(&instr, &mut ctx);
        match sim.execute(&instr) {
            SimOutcome::Ok => {}
            SimOutcome::Unimplemented(op) => {
                eprintln!("{prg_name}: unimplemented opcode {op} at offset {offset}, halting");
                had_error = true;
                break;
            }
            SimOutcome::Invalid => {
                had_error = true;
                break;
            }
        }
        offset += instr.size_bytes as usize;
    }

    let mut text = String::new();
    for reg in [
        i8086_asm::reg::Reg::A,
        i8086_asm::reg::Reg::B,
        i8086_asm::reg::Reg::C,
        i8086_asm::reg::Reg::D,
        i8086_asm::reg::Reg::Sp,
        i8086_asm::reg::Reg::Bp,
        i8086_asm::reg::Reg::Si,
        i8086_asm::reg::Reg::Di,
        i8086_asm::reg::Reg::Es,
        i8086_asm::reg::Reg::Cs,
        i8086_asm::reg::Reg::Ss,
        i8086_asm::reg::Reg::Ds,
    ] {
        let _ = std::fmt::Write::write_fmt(
            &mut text,
            format_args!("{reg:>5} = 0x{:04x}\n", sim.registers()[reg.index()]),
        );
    }

    let write_code = write_output(prg_name, output_path, &text);
    if had_error {
        1
    } else {
        write_code
    }
}
