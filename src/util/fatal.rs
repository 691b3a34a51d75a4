use std::fmt;

/// Reports a broken host/engine contract and aborts the process.
///
/// Protocol violations leave the heap in an unknown state, so there is nothing to unwind to.
#[cold]
#[inline(never)]
pub fn invariant_violation(args: fmt::Arguments<'_>) -> ! {
    log::error!("fatal: {}", args);
    let backtrace = backtrace::Backtrace::new();
    eprintln!("comet: fatal invariant violation: {}\n{:?}", args, backtrace);
    std::process::abort();
}

macro_rules! fatal {
    ($($t:tt)*) => {
        $crate::util::fatal::invariant_violation(format_args!($($t)*))
    };
}
