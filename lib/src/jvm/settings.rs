/// Knobs for loading and writing class files
#[derive(Clone, Debug)]
pub struct Settings {
    /// Rebuild the constant pool from scratch (and sort it) when writing out a modified class
    ///
    /// Pools that are order-significant are always extended in place instead.
    pub optimize_constant_pool: bool,

    /// Most paths a control flow walk may have pending at once before giving up
    pub max_pending_paths: usize,

    /// Newest class file major version accepted when loading
    pub max_major_version: u16,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            optimize_constant_pool: true,
            max_pending_paths: 1 << 16,
            max_major_version: 65,
        }
    }
}
