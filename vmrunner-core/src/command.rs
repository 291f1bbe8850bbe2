//! Command-line assembly for commands sent to the guest.

/// Join `args` into a single command line.
///
/// Arguments containing a space are wrapped in double quotes; nothing else
/// is escaped. The guest shell sees the line exactly as produced here.
#[must_use]
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if arg.contains(' ') {
                format!("\"{arg}\"")
            } else {
                arg.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
