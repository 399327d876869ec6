use clap::Parser;
use goblin::elf::{Elf, program_header::PT_LOAD};
use log::info;
use std::fs;
use std::path::PathBuf;

use hazard_vm::bus::{Bus, FLASH_BASE};
use hazard_vm::{Chip, Fault};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Firmware image to run (ELF or raw binary; raw loads at flash base)
    #[arg(short, long)]
    firmware: PathBuf,

    /// Boot ROM image (raw little-endian words); without one, execution
    /// starts directly at the firmware entry point with core 1 parked
    #[arg(long)]
    bootrom: Option<PathBuf>,

    /// Load address for raw firmware images
    #[arg(long, default_value_t = FLASH_BASE)]
    load_addr: u32,

    /// Disassembly listing used for fault diagnostics
    #[arg(long)]
    disasm: Option<PathBuf>,

    /// Stop after this many machine steps (0 = run until fault)
    #[arg(long, default_value_t = 0)]
    steps: u64,
}

/// Load an ELF's PT_LOAD segments through the bus write surface and
/// return the entry point.
fn load_elf(chip: &mut Chip, buffer: &[u8]) -> Result<u32, Box<dyn std::error::Error>> {
    let elf = Elf::parse(buffer)?;
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        let file_range = ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize;
        if file_range.end > buffer.len() {
            return Err(format!("segment exceeds file bounds (offset {:#x})", ph.p_offset).into());
        }
        let target = if ph.p_paddr != 0 {
            ph.p_paddr
        } else {
            ph.p_vaddr
        } as u32;
        for (i, chunk) in buffer[file_range].chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            chip.bus
                .write_u32(target + 4 * i as u32, u32::from_le_bytes(word));
        }
        info!(
            "loaded segment {:#010x}..{:#010x}",
            target,
            target + ph.p_filesz as u32
        );
    }
    Ok(elf.entry as u32)
}

fn load_raw(chip: &mut Chip, base: u32, buffer: &[u8]) {
    for (i, chunk) in buffer.chunks(4).enumerate() {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        chip.bus
            .write_u32(base + 4 * i as u32, u32::from_le_bytes(word));
    }
    info!("loaded {} bytes at {:#010x}", buffer.len(), base);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut chip = Chip::new();

    if let Some(path) = &args.bootrom {
        let bytes = fs::read(path)?;
        let words: Vec<u32> = bytes
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            })
            .collect();
        chip.load_bootrom(&words);
        info!("boot ROM: {} words", words.len());
    }

    let firmware = fs::read(&args.firmware)?;
    let entry = if firmware.starts_with(b"\x7fELF") {
        load_elf(&mut chip, &firmware)?
    } else {
        load_raw(&mut chip, args.load_addr, &firmware);
        args.load_addr
    };

    if args.bootrom.is_none() {
        // no boot ROM to dispatch the cores: start core 0 at the image
        // entry and park core 1 the way the ROM would have left it
        chip.core0.pc = entry;
        chip.core1.waiting = true;
        info!("starting at {entry:#010x}");
    }

    if let Some(path) = &args.disasm {
        chip.load_disassembly(&fs::read_to_string(path)?);
    }

    let mut steps: u64 = 0;
    let result: Result<(), Fault> = loop {
        if let Err(fault) = chip.step() {
            break Err(fault);
        }
        steps += 1;
        if args.steps != 0 && steps >= args.steps {
            break Ok(());
        }
    };

    println!(
        "ran {steps} steps, core0 cycles={}, core1 cycles={}",
        chip.core0.cycles, chip.core1.cycles
    );
    match result {
        Ok(()) => Ok(()),
        Err(fault) => Err(fault.into()),
    }
}
