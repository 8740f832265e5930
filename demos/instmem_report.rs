use instmem_rs::device::sim::{SimConfig, SimDevice};
use instmem_rs::{InstFlags, Instmem, InstmemResult};
use std::io;

// Helper to describe the three simulated boards we bring up
fn boards() -> Vec<(&'static str, SimConfig)> {
    vec![
        ("G70 (dedicated VRAM)", SimConfig::dedicated_vram(0x47)),
        (
            "GK20A (IOMMU)",
            SimConfig::system_memory(0xea).with_iommu(1 << 30),
        ),
        ("GK20A (DMA API)", SimConfig::system_memory(0xea)),
    ]
}

fn exercise(imem: &Instmem) -> InstmemResult<()> {
    imem.init()?;

    let obj = imem.allocate(0x5000, 0x1000, InstFlags::ZERO)?;
    println!(
        "  - Object: offset 0x{:x}, size 0x{:x}, pages {}",
        obj.offset(),
        obj.size(),
        obj.mem().size
    );

    let pattern: Vec<u32> = (0..16).map(|i| 0xc0de_0000 | i).collect();
    obj.write_words(0x1000, &pattern);
    let mut readback = vec![0; pattern.len()];
    obj.read_words(0x1000, &mut readback);
    println!(
        "  - Readback: {}",
        if readback == pattern { "OK" } else { "MISMATCH" }
    );

    imem.suspend()?;
    imem.resume()?;
    println!("  - Suspend/resume: OK, word 0 = 0x{:08x}", obj.rd32(0x1000));
    Ok(())
}

fn main() -> io::Result<()> {
    env_logger::init();

    println!("--- Instance Memory Report ---");

    for (name, config) in boards() {
        println!("\n{name}");
        let device = SimDevice::new(config)?;

        let imem = match Instmem::new(&device) {
            Ok(imem) => imem,
            Err(e) => {
                eprintln!("  Error bringing up instmem: {e}");
                continue;
            }
        };

        println!("  - Strategy: {}", imem.strategy());
        if let Some(layout) = imem.reserved_layout() {
            println!(
                "  - Reserved: 0x{:x} bytes ({} shader units, 0x{:x} context bytes/channel)",
                layout.reserved, layout.shader_units, layout.context_size
            );
            println!(
                "  - VBIOS {}  RAMHT {}  RAMRO {}  RAMFC {}",
                layout.vbios, layout.ramht, layout.ramro, layout.ramfc
            );
        }

        if let Err(e) = exercise(&imem) {
            eprintln!("  Error: {e}");
        }

        println!(
            "  - Live objects: {}, PRAMIN window reprograms: {}",
            imem.live_objects(),
            device.window_writes()
        );
        imem.destroy();
    }

    Ok(())
}
