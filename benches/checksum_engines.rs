use std::hint::black_box;
use std::time::{Duration, Instant};
use tun_offload::{gso_split_with, ChecksumEngine, Generic32, Generic64, GsoOptions, GsoType};

fn engines() -> Vec<Box<dyn ChecksumEngine>> {
    let mut engines: Vec<Box<dyn ChecksumEngine>> = vec![Box::new(Generic64), Box::new(Generic32)];
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(engine) = tun_offload::Sse41::new() {
            engines.push(Box::new(engine));
        }
        if let Some(engine) = tun_offload::Avx2::new() {
            engines.push(Box::new(engine));
        }
    }
    engines
}

fn benchmark_checksum(engine: &dyn ChecksumEngine, size: usize, iterations: usize) {
    let data: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
    let start = Instant::now();
    for _ in 0..iterations {
        black_box(engine.checksum(black_box(&data), 0));
    }
    let total_time = start.elapsed();
    report(engine.name(), size, iterations, total_time);
}

fn benchmark_split(engine: &dyn ChecksumEngine, iterations: usize) {
    // 64 KiB of TCP payload behind IPv4 and TCP headers
    let payload_len = 65535 - 40;
    let mut input = vec![0u8; 40 + payload_len];
    input[0] = 0x45;
    input[9] = 6;
    input[32] = 5 << 4;
    input[33] = 0x10;
    let options = GsoOptions {
        gso_type: GsoType::TcpV4,
        hdr_len: 40,
        csum_start: 20,
        csum_offset: 16,
        gso_size: 1460,
        needs_csum: false,
    };
    let mut bufs = vec![vec![0u8; 1500]; 64];
    let mut sizes = vec![0usize; 64];

    let start = Instant::now();
    for _ in 0..iterations {
        let n = gso_split_with(engine, &mut input, options, &mut bufs, &mut sizes, 0).unwrap();
        black_box(n);
    }
    let total_time = start.elapsed();
    report(&format!("gso_split/{}", engine.name()), input.len(), iterations, total_time);
}

fn report(name: &str, size: usize, iterations: usize, total_time: Duration) {
    let throughput = (iterations as f64) / total_time.as_secs_f64();
    println!("{}: {} bytes", name, size);
    println!("  Total time: {:?}", total_time);
    println!("  Average time: {:?}", total_time / iterations as u32);
    println!(
        "  Bandwidth: {:.2} GB/s",
        throughput * size as f64 / 1_000_000_000.0
    );
}

fn main() {
    println!("=== Checksum Engine Benchmark ===");
    println!("Detected: {}\n", tun_offload::detect().name());
    for engine in engines() {
        for size in [40, 576, 1500, 9000, 65535] {
            benchmark_checksum(engine.as_ref(), size, 200_000);
        }
        benchmark_split(engine.as_ref(), 2_000);
        println!();
    }
}
