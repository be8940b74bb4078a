use std::io;
use std::path::Path;

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// The number of `block_size` blocks needed to hold `bytes`.
pub(crate) fn blocks_for(bytes: u64, block_size: usize) -> u64 {
    bytes.div_ceil(block_size as u64)
}

pub(crate) fn create_file(path: &Path, allow_existing: bool) -> io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    options.read(true);

    if allow_existing {
        options.create(true);
    } else {
        options.create_new(true);
    }

    let file = options.open(path)?;

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::OpenOptions::new()
                .read(true)
                .open(parent)?
                .sync_all()?;
        }
    }

    Ok(file)
}

#[cfg(test)]
/// Turn a fail point's configured value into an I/O error.
///
/// `return(5)` maps to the raw OS error 5, a bare `return` to a generic error.
pub(crate) fn parse_io_error_return<T>(value: Option<String>) -> Result<T, io::Error> {
    let Some(value) = value else {
        return Err(io::Error::other("storage fail point error"));
    };
    let error_code = value
        .parse::<i32>()
        .expect("invalid io error code provided");
    Err(io::Error::from_raw_os_error(error_code))
}
