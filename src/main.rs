use ndsim::device::{Device, LineFrontend, RunStats};
use ndsim::kernel::Kernel;
use ndsim::metrics::MetricsPlugin;
use ndsim::samples;
use ndsim::value::TypedValue;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if cfg!(debug_assertions) {
        colog::default_builder()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        colog::default_builder().init();
    }

    let mut device = Device::from_env();
    if device.config().interactive {
        let stdin = std::io::BufReader::new(std::io::stdin());
        device.set_frontend(Box::new(LineFrontend::new(stdin, std::io::stdout())));
    }
    let metrics = Arc::new(MetricsPlugin::new());
    device.add_plugin(metrics.clone());
    println!(
        "Initialized device: {}KiB global, {}KiB local per group, policy={}",
        device.config().global_memory_size / 1024,
        device.config().local_memory_size / 1024,
        device.config().policy.name(),
    );

    // --- Vector addition demo ---
    // out[i] = a[i] + b[i] with a[i] = i and b[i] = n - i, so every out[i] = n
    let n = 1024usize;
    let global = device.global_memory();
    let a = global.allocate(n * 4)?;
    let b = global.allocate(n * 4)?;
    let out = global.allocate(n * 4)?;
    let a_data: Vec<u8> = (0..n).flat_map(|i| (i as f32).to_ne_bytes()).collect();
    let b_data: Vec<u8> = (0..n).flat_map(|i| ((n - i) as f32).to_ne_bytes()).collect();
    global.host_store(a, &a_data)?;
    global.host_store(b, &b_data)?;

    let mut kernel = Kernel::new(Arc::new(samples::vector_add()), "vector_add")?;
    kernel.set_argument(0, TypedValue::pointer(a))?;
    kernel.set_argument(1, TypedValue::pointer(b))?;
    kernel.set_argument(2, TypedValue::pointer(out))?;
    let stats = device.run(&mut kernel, 1, &[], &[n], &[128])?;

    let result = device.global_memory().host_load(out, n * 4)?;
    let mismatches = result
        .chunks(4)
        .enumerate()
        .filter(|(_, c)| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]) != n as f32)
        .count();
    if mismatches == 0 && !stats.quit {
        println!("Verification PASSED: all {n} results correct (each = {n})");
    } else {
        println!("Verification FAILED: {mismatches} of {n} results wrong");
    }
    print_stats("vector_add", &stats);

    // --- Local memory + barrier demo ---
    // Each group of 8 rotates its slice left by one through local scratch.
    let n = 64usize;
    let global = device.global_memory();
    let input = global.allocate(n * 4)?;
    let output = global.allocate(n * 4)?;
    let data: Vec<u8> = (0..n as u32).flat_map(|v| v.to_ne_bytes()).collect();
    global.host_store(input, &data)?;

    let local = 8usize;
    let mut kernel = Kernel::new(Arc::new(samples::rotate_local()), "rotate_local")?;
    kernel.set_argument(0, TypedValue::pointer(input))?;
    kernel.set_argument(1, TypedValue::pointer(output))?;
    kernel.set_argument(2, TypedValue::new(local * 4, 1))?;
    let stats = device.run(&mut kernel, 1, &[], &[n], &[local])?;

    let result = device.global_memory().host_load(output, n * 4)?;
    let correct = result.chunks(4).enumerate().all(|(i, c)| {
        let group = i / local;
        let expected = (group * local + (i % local + 1) % local) as u32;
        u32::from_ne_bytes([c[0], c[1], c[2], c[3]]) == expected
    });
    if correct && !stats.quit {
        println!("Verification PASSED: {n} items rotated within groups of {local}");
    } else {
        println!("Verification FAILED: rotate_local produced unexpected output");
    }
    print_stats("rotate_local", &stats);

    let totals = metrics.snapshot();
    println!(
        "Metrics: {} loads | {} stores | {} barriers | snapshot at {}",
        totals.loads,
        totals.stores,
        totals.barriers,
        metrics.path().display(),
    );
    Ok(())
}

fn print_stats(name: &str, stats: &RunStats) {
    println!(
        "Stats [{name}]: {} groups | {} items ({} completed, {} failed) | {} instructions | {} barriers",
        stats.groups, stats.items, stats.completed, stats.failed, stats.instructions, stats.barriers,
    );
}
