//! Frame scheduling and pagination benchmarks.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chatreel::script::parse_threads;
use chatreel::timeline::{paginate_bubbles, schedule_frames};

fn bench_schedule(c: &mut Criterion) {
    let durations = (0..2_000)
        .map(|i| 0.25 + f64::from(i % 17) * 0.137)
        .collect::<Vec<_>>();
    let flags = (0..2_000).map(|i| i % 11 == 0).collect::<Vec<_>>();

    let mut group = c.benchmark_group("timeline");
    group.bench_function("schedule_2000_scenes_30fps", |b| {
        b.iter(|| black_box(schedule_frames(black_box(&durations), 30)));
    });
    group.bench_function("paginate_2000_bubbles", |b| {
        b.iter(|| black_box(paginate_bubbles(black_box(&flags), 6, 3)));
    });
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut script = String::from("iMessage: Bob | bob.png\n");
    for i in 0..500 {
        script.push_str(&format!("Bob > me: line {i} with {{secret}} [ding]\n"));
        script.push_str(&format!("me: reply {i} == spoken {i}\n"));
        if i % 50 == 0 {
            script.push_str("<break:500ms>\n");
        }
    }

    c.bench_function("parse_1000_line_script", |b| {
        b.iter(|| black_box(parse_threads(black_box(&script))));
    });
}

criterion_group!(benches, bench_schedule, bench_parse);
criterion_main!(benches);
