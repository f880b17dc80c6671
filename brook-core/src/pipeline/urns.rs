//! Well-known URNs understood by the engine.

// Transforms executed by the engine itself.
pub const TRANSFORM_IMPULSE: &str = "beam:transform:impulse:v1";
pub const TRANSFORM_GBK: &str = "beam:transform:group_by_key:v1";
pub const TRANSFORM_FLATTEN: &str = "beam:transform:flatten:v1";
pub const TRANSFORM_TEST_STREAM: &str = "beam:transform:teststream:v1";
pub const TRANSFORM_WINDOW_INTO: &str = "beam:transform:window_into:v1";

// Transforms handed to a worker.
pub const TRANSFORM_PARDO: &str = "beam:transform:pardo:v1";

// Coders.
pub const CODER_BYTES: &str = "beam:coder:bytes:v1";
pub const CODER_STRING_UTF8: &str = "beam:coder:string_utf8:v1";
pub const CODER_VARINT: &str = "beam:coder:varint:v1";
pub const CODER_BOOL: &str = "beam:coder:bool:v1";
pub const CODER_DOUBLE: &str = "beam:coder:double:v1";
pub const CODER_KV: &str = "beam:coder:kv:v1";
pub const CODER_ITERABLE: &str = "beam:coder:iterable:v1";
pub const CODER_LENGTH_PREFIX: &str = "beam:coder:length_prefix:v1";
pub const CODER_GLOBAL_WINDOW: &str = "beam:coder:global_window:v1";
pub const CODER_INTERVAL_WINDOW: &str = "beam:coder:interval_window:v1";
pub const CODER_WINDOWED_VALUE: &str = "beam:coder:windowed_value:v1";

// Window functions.
pub const WINDOW_FN_GLOBAL: &str = "beam:window_fn:global_windows:v1";
pub const WINDOW_FN_FIXED: &str = "beam:window_fn:fixed_windows:v1";
pub const WINDOW_FN_SLIDING: &str = "beam:window_fn:sliding_windows:v1";
pub const WINDOW_FN_SESSION: &str = "beam:window_fn:session_windows:v1";

// Environments.
pub const ENV_EXTERNAL: &str = "beam:env:external:v1";

// Side input access patterns.
pub const SIDE_INPUT_ITERABLE: &str = "beam:side_input:iterable:v1";
pub const SIDE_INPUT_MULTIMAP: &str = "beam:side_input:multimap:v1";

/// Coders whose encoding is self-delimiting when nested, and which the
/// engine can therefore decode without a length prefix.
pub fn is_known_coder(urn: &str) -> bool {
    matches!(
        urn,
        CODER_BYTES
            | CODER_STRING_UTF8
            | CODER_VARINT
            | CODER_BOOL
            | CODER_DOUBLE
            | CODER_KV
            | CODER_ITERABLE
            | CODER_LENGTH_PREFIX
            | CODER_GLOBAL_WINDOW
            | CODER_INTERVAL_WINDOW
            | CODER_WINDOWED_VALUE
    )
}

/// Whether a transform with this URN runs inside the engine rather than on a worker.
pub fn is_runner_transform(urn: &str) -> bool {
    matches!(
        urn,
        TRANSFORM_IMPULSE
            | TRANSFORM_GBK
            | TRANSFORM_FLATTEN
            | TRANSFORM_TEST_STREAM
            | TRANSFORM_WINDOW_INTO
    )
}
