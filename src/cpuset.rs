//! CPU set strings in the Linux taskset/numactl format.
//!
//! `"0-3,8"` selects CPUs 0, 1, 2, 3 and 8. A configured CPU set caps the
//! default worker count and, with `pin_threads`, is the pool workers are
//! pinned over.

use crate::error::{Result, SmpError};

/// Parse a CPU set string into a sorted, deduplicated list of CPU ids.
///
/// ```
/// use smp_rs::cpuset::parse_cpuset;
///
/// assert_eq!(parse_cpuset("0-2,8").unwrap(), vec![0, 1, 2, 8]);
/// assert_eq!(parse_cpuset("4,0,4").unwrap(), vec![0, 4]);
/// ```
///
/// # Errors
///
/// Returns `SmpError::InvalidCpuSet` for empty strings, non-numeric ids and
/// reversed ranges.
pub fn parse_cpuset(s: &str) -> Result<Vec<usize>> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SmpError::InvalidCpuSet("empty cpuset string".to_string()));
    }

    let parse_id = |text: &str, part: &str| -> Result<usize> {
        text.trim()
            .parse()
            .map_err(|_| SmpError::InvalidCpuSet(format!("invalid CPU id in '{part}'")))
    };

    let mut cpus = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_id(start, part)?, parse_id(end, part)?);
                if start > end {
                    return Err(SmpError::InvalidCpuSet(format!(
                        "range start {start} > end {end} in '{part}'"
                    )));
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(parse_id(part, part)?),
        }
    }

    if cpus.is_empty() {
        return Err(SmpError::InvalidCpuSet("no CPU ids found".to_string()));
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Render CPU ids in the compact form [`parse_cpuset`] accepts.
///
/// ```
/// use smp_rs::cpuset::format_cpuset;
///
/// assert_eq!(format_cpuset(&[0, 1, 2, 3, 8, 10, 11]), "0-3,8,10-11");
/// ```
pub fn format_cpuset(cpus: &[usize]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        parts.push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        });
    }
    parts.join(",")
}

/// Logical CPU ids this process may run on, as reported by `core_affinity`.
///
/// Empty if the platform does not report affinity.
pub fn available_cpus() -> Vec<usize> {
    core_affinity::get_core_ids()
        .map(|ids| ids.into_iter().map(|id| id.id).collect())
        .unwrap_or_default()
}

/// Check that every CPU in `cpus` is available.
///
/// Platforms that report no CPUs at all are not validated against.
///
/// # Errors
///
/// Returns `SmpError::CpuNotAvailable` for the first unavailable CPU.
pub fn validate_cpuset(cpus: &[usize]) -> Result<()> {
    let available = available_cpus();
    if available.is_empty() {
        return Ok(());
    }
    match cpus.iter().find(|cpu| !available.contains(cpu)) {
        Some(&cpu) => Err(SmpError::CpuNotAvailable(cpu)),
        None => Ok(()),
    }
}

/// [`parse_cpuset`] followed by [`validate_cpuset`].
pub fn parse_and_validate_cpuset(s: &str) -> Result<Vec<usize>> {
    let cpus = parse_cpuset(s)?;
    validate_cpuset(&cpus)?;
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_ranges() {
        assert_eq!(parse_cpuset("5").unwrap(), vec![5]);
        assert_eq!(parse_cpuset("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpuset("0,2-4,8").unwrap(), vec![0, 2, 3, 4, 8]);
    }

    #[test]
    fn test_parse_whitespace_sort_dedup() {
        assert_eq!(parse_cpuset(" 0 - 2 , 1 ").unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_cpuset("8-9,0").unwrap(), vec![0, 8, 9]);
        assert_eq!(parse_cpuset("1,,2").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_cpuset("").is_err());
        assert!(parse_cpuset(" , ").is_err());
        assert!(parse_cpuset("abc").is_err());
        assert!(parse_cpuset("0-x").is_err());
        assert!(parse_cpuset("-1").is_err());
        assert!(matches!(
            parse_cpuset("5-3"),
            Err(SmpError::InvalidCpuSet(msg)) if msg.contains("5 > end 3")
        ));
    }

    #[test]
    fn test_format_cpuset() {
        assert_eq!(format_cpuset(&[]), "");
        assert_eq!(format_cpuset(&[3]), "3");
        assert_eq!(format_cpuset(&[2, 0, 1, 5]), "0-2,5");
        let cpus = vec![0, 1, 4, 6, 7, 8];
        assert_eq!(parse_cpuset(&format_cpuset(&cpus)).unwrap(), cpus);
    }

    #[test]
    fn test_validate_cpuset() {
        let available = available_cpus();
        assert!(validate_cpuset(&available).is_ok());
        if !available.is_empty() {
            assert!(matches!(
                validate_cpuset(&[usize::MAX]),
                Err(SmpError::CpuNotAvailable(usize::MAX))
            ));
        }
    }
}
