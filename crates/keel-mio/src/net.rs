use std::io::ErrorKind;

/// Map a would-block result to `None`.
///
/// WouldBlock just means we've run out of things to handle, it's not an error for a
/// non-blocking socket.
pub fn check_io<T>(value: Result<T, std::io::Error>) -> Result<Option<T>, std::io::Error> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            if error.kind() == ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(error)
            }
        }
    }
}
