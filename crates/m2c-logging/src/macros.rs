//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Structured logging adapters and sinks."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
/// Shared expansion for the level-specific macros below.
#[doc(hidden)]
#[macro_export]
macro_rules! __m2c_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            connection = ctx.connection.unwrap_or(""),
            tag = ctx.tag.unwrap_or(""),
            sequence = ctx.sequence,
            protocol = ctx.protocol.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with connection context.
#[macro_export]
macro_rules! m2c_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__m2c_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__m2c_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with connection context.
#[macro_export]
macro_rules! m2c_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__m2c_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__m2c_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with connection context.
#[macro_export]
macro_rules! m2c_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__m2c_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__m2c_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with connection context.
#[macro_export]
macro_rules! m2c_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__m2c_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__m2c_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
