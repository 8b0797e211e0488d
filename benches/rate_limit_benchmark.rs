use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use focusflow_auth::models::{RateLimitAction, RateLimitRecord};

fn benchmark_record_attempt(c: &mut Criterion) {
    let policy = RateLimitAction::Otp.policy();
    let now = Utc::now();

    let mut group = c.benchmark_group("rate_limit_decisions");

    group.bench_function("attempt_within_window", |b| {
        b.iter(|| {
            let mut record = RateLimitRecord::new(now);
            black_box(record.record_attempt(black_box(policy), now))
        })
    });

    group.bench_function("attempt_against_active_block", |b| {
        let mut blocked = RateLimitRecord::new(now);
        for _ in 0..=policy.max_attempts {
            blocked.record_attempt(policy, now);
        }
        b.iter(|| {
            let mut record = blocked.clone();
            black_box(record.record_attempt(black_box(policy), now))
        })
    });

    group.bench_function("attempt_after_window_reset", |b| {
        let mut stale = RateLimitRecord::new(now);
        for _ in 0..policy.max_attempts {
            stale.record_attempt(policy, now);
        }
        let later = now + Duration::seconds(policy.window_seconds + 1);
        b.iter(|| {
            let mut record = stale.clone();
            black_box(record.record_attempt(black_box(policy), later))
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_record_attempt);
criterion_main!(benches);
