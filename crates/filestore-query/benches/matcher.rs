//! Matcher throughput against a hand-translated regex over generated ids

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use filestore_common::FsId;
use filestore_query::Matcher;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;

const CADENCES: [&str; 4] = ["long", "short", "ffi", "calibration"];

/// Ids shaped like `/pdc/<cadence>/<module>/<target>:<mjd>`
fn population(count: usize) -> Vec<FsId> {
    let mut rng = StdRng::seed_from_u64(0x6b65_706c_6572);
    (0..count)
        .map(|_| {
            let cadence = CADENCES[rng.gen_range(0..CADENCES.len())];
            let module = rng.gen_range(2..25);
            let target = rng.gen_range(100..2000);
            let mjd = rng.gen_range(54_900..56_500);
            FsId::parse(&format!("/pdc/{cadence}/m{module}/{target}:{mjd}")).unwrap()
        })
        .collect()
}

/// Pattern pairs: the store's syntax and an equivalent regex.
/// Integer ranges become a capture checked after the regex matches.
fn cases() -> Vec<(&'static str, &'static str, Regex, Option<(u64, u64)>)> {
    vec![
        (
            "glob",
            "t@/pdc/long/*",
            Regex::new(r"^/pdc/long/.*$").unwrap(),
            None,
        ),
        (
            "enumeration",
            "t@/pdc/[long,short]/\\w/\\d:\\d",
            Regex::new(r"^/pdc/(long|short)/\w+/[0-9]+(\.[0-9]+)?:[0-9]+(\.[0-9]+)?$").unwrap(),
            None,
        ),
        (
            "range",
            "t@/pdc/*/m1[0-9]/[100-1110]:\\d",
            Regex::new(r"^/pdc/.*/m1[0-9]/([0-9]+):[0-9]+(\.[0-9]+)?$").unwrap(),
            Some((100, 1110)),
        ),
    ]
}

fn regex_match(re: &Regex, range: Option<(u64, u64)>, id: &str) -> bool {
    match range {
        None => re.is_match(id),
        Some((lo, hi)) => re
            .captures(id)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .is_some_and(|v| (lo..=hi).contains(&v)),
    }
}

fn bench_matcher(c: &mut Criterion) {
    let ids = population(100_000);

    for (name, pattern, re, range) in cases() {
        let matcher = Matcher::compile(pattern).unwrap();
        let expected = ids.iter().filter(|id| matcher.is_match(id)).count();
        assert_eq!(
            expected,
            ids.iter().filter(|id| regex_match(&re, range, id.as_str())).count(),
            "{pattern} disagrees with its regex"
        );

        let mut group = c.benchmark_group(format!("match_{name}"));
        for count in [1_000, 10_000, 100_000] {
            let slice = &ids[..count];
            group.throughput(Throughput::Elements(count as u64));

            group.bench_with_input(BenchmarkId::new("matcher", count), slice, |b, slice| {
                b.iter(|| {
                    let mut hits = 0usize;
                    for id in slice {
                        let r = matcher.matches(id);
                        hits += usize::from(r.complete_match);
                        black_box(r);
                    }
                    hits
                });
            });

            group.bench_with_input(BenchmarkId::new("regex", count), slice, |b, slice| {
                b.iter(|| {
                    slice
                        .iter()
                        .filter(|id| regex_match(&re, range, black_box(id.as_str())))
                        .count()
                });
            });
        }
        group.finish();
    }
}

/// Directory pruning during a walk of the id tree
fn bench_directory_pruning(c: &mut Criterion) {
    let matcher = Matcher::compile("t@/pdc/[long,short]/m1[0-9]/\\d").unwrap();
    let dirs: Vec<String> = CADENCES
        .iter()
        .flat_map(|cadence| (2..25).map(move |m| format!("/pdc/{cadence}/m{m}")))
        .collect();

    let mut group = c.benchmark_group("matches_directory");
    group.throughput(Throughput::Elements(dirs.len() as u64));
    group.bench_function("walk", |b| {
        b.iter(|| {
            dirs.iter()
                .filter(|d| matcher.matches_directory(black_box(d)).path_matched)
                .count()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_matcher, bench_directory_pruning);
criterion_main!(benches);
