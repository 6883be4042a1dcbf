// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Root logger construction for the `signbroker` binary.
//!
//! Mirrors `pyoxidizer/src/logging.rs`'s `LoggerContext`/verbosity-driven
//! `slog::Level` shape, but backs it with a real terminal drain
//! (`slog-term`) wrapped in `slog-async` so structured log records from
//! concurrently-running container/dispatch futures don't serialize on a
//! shared stderr lock.

use slog::Drain;

/// Wraps an already-fused drain (`Ok = (), Err = Never`) and discards any
/// record below `min_level` before it reaches the inner drain. Written by
/// hand rather than reaching for `slog::LevelFilter` because that type
/// changes its `Ok` associated type to `Option<D::Ok>`, which doesn't
/// satisfy the `Ok = ()` bound `slog_async::Async::new` requires.
struct LevelGate<D> {
    drain: D,
    min_level: slog::Level,
}

impl<D> slog::Drain for LevelGate<D>
where
    D: slog::Drain<Ok = (), Err = slog::Never>,
{
    type Ok = ();
    type Err = slog::Never;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.min_level) {
            self.drain.log(record, values)
        } else {
            Ok(())
        }
    }
}

/// Holds the root logger for the process lifetime. `_guard` keeps the
/// async drain's worker thread alive; dropping it flushes pending records.
pub struct LoggerContext {
    pub logger: slog::Logger,
    _guard: slog_async::AsyncGuard,
}

/// Map repeated `-v` flags to a `slog::Level`, matching the teacher's
/// verbosity convention: no flag is `Warning`, one `-v` is `Info`, two or
/// more is `Debug`.
pub fn level_for_verbosity(verbosity: u64) -> slog::Level {
    match verbosity {
        0 => slog::Level::Warning,
        1 => slog::Level::Info,
        _ => slog::Level::Debug,
    }
}

/// Build the process root logger at the given level, writing to stderr.
pub fn logger_at_level(min_level: slog::Level) -> LoggerContext {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let term_drain = slog_term::FullFormat::new(decorator).build().fuse();
    let (async_drain, guard) = slog_async::Async::new(term_drain).build_with_guard();
    let gated = LevelGate {
        drain: async_drain,
        min_level,
    };

    LoggerContext {
        logger: slog::Logger::root(gated, slog::o!()),
        _guard: guard,
    }
}

/// Construct the root logger from `-v` occurrence count (spec §11).
pub fn logger_from_verbosity(verbosity: u64) -> LoggerContext {
    logger_at_level(level_for_verbosity(verbosity))
}
