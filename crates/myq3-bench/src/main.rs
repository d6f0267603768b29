// main.rs — randomized collision benchmark
//
// Loads a Quake 3 .bsp and times a batch of random traces scattered over
// the map's bounds: rays first, then player-sized boxes.

use std::time::Instant;

use myq3_collision::math::Vec3;
use myq3_collision::{trace, Bounds, CollisionBsp};
use rand::Rng;

const DEFAULT_TRACE_COUNT: usize = 1_000_000;

fn usage() -> ! {
    println!("myq3-bench - random collision traces against a Quake 3 BSP\n");
    println!("  myq3-bench [-c count] <map.bsp>\n");
    println!("  -c count   number of traces per pass (default {})", DEFAULT_TRACE_COUNT);
    println!("  -h         this help text");
    std::process::exit(0);
}

fn main() {
    env_logger::init();

    let mut count = DEFAULT_TRACE_COUNT;
    let mut path: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => usage(),
            "-c" => {
                let value = args.next().unwrap_or_else(|| {
                    eprintln!("-c needs a number");
                    std::process::exit(1);
                });
                count = value.parse().unwrap_or_else(|_| {
                    eprintln!("bad trace count: {}", value);
                    std::process::exit(1);
                });
            }
            _ => path = Some(arg),
        }
    }

    let Some(path) = path else {
        eprintln!("no map given, try -h");
        std::process::exit(1);
    };

    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("couldn't read {}: {}", path, err);
            std::process::exit(1);
        }
    };

    let bsp = match CollisionBsp::from_bytes(&data) {
        Ok(bsp) => bsp,
        Err(err) => {
            eprintln!("couldn't load {}: {}", path, err);
            std::process::exit(1);
        }
    };

    let (mins, maxs) = bsp.world_bounds();
    log::info!(
        "world bounds {:?} .. {:?}, {} traces per pass",
        mins,
        maxs,
        count
    );

    run_pass("ray", &bsp, count, mins, maxs, |start, end| {
        Bounds::ray(start, end)
    });
    run_pass("box", &bsp, count, mins, maxs, |start, end| {
        Bounds::aabb(start, end, [-16.0, -16.0, -24.0], [16.0, 16.0, 32.0])
    });
}

fn run_pass(
    name: &str,
    bsp: &CollisionBsp,
    count: usize,
    mins: Vec3,
    maxs: Vec3,
    make_bounds: impl Fn(Vec3, Vec3) -> Bounds,
) {
    let mut rng = rand::thread_rng();
    let random_point = |rng: &mut rand::rngs::ThreadRng| -> Vec3 {
        [
            rng.gen_range(mins[0] - 64.0..maxs[0] + 64.0),
            rng.gen_range(mins[1] - 64.0..maxs[1] + 64.0),
            rng.gen_range(mins[2] - 64.0..maxs[2] + 64.0),
        ]
    };

    // Keep a checksum of the fractions so the traces cannot be optimized
    // away.
    let mut fraction_sum = 0.0f64;
    let mut hits = 0usize;

    let begin = Instant::now();
    for _ in 0..count {
        let start = random_point(&mut rng);
        let end = random_point(&mut rng);
        let result = trace(bsp, &make_bounds(start, end));
        fraction_sum += result.fraction as f64;
        if result.hit() {
            hits += 1;
        }
    }
    let elapsed = begin.elapsed();

    println!(
        "{:>4}: {} traces took {} us ({:.3} us/trace), {} hits",
        name,
        count,
        elapsed.as_micros(),
        elapsed.as_micros() as f64 / count as f64,
        hits
    );
    log::debug!("{} fraction sum {}", name, fraction_sum);
}
