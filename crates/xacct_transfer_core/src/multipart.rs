use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ServiceError};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 5 * GIB;
pub const DEFAULT_PART_SIZE: u64 = 100 * MIB;
pub const MIN_PART_SIZE: u64 = 5 * MIB;
pub const MAX_PART_SIZE: u64 = 5 * GIB;
pub const MAX_OBJECT_SIZE: u64 = 5 * TIB;
pub const MAX_PARTS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    SingleCopy,
    Multipart,
}

pub fn select_strategy(size: u64, threshold: u64) -> CopyStrategy {
    if size < threshold {
        CopyStrategy::SingleCopy
    } else {
        CopyStrategy::Multipart
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRange {
    pub part_number: u32,
    pub start: u64,
    pub end_inclusive: u64,
}

impl PartRange {
    pub fn byte_len(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }

    pub fn http_range(&self) -> String {
        format!("bytes={}-{}", self.start, self.end_inclusive)
    }
}

/// Splits `size` bytes into fixed `part_size` ranges; the last range carries
/// the remainder. Part numbers start at 1.
pub fn plan_parts(size: u64, part_size: u64) -> Result<Vec<PartRange>, ServiceError> {
    if part_size == 0 {
        return Err(ServiceError::new(
            ErrorKind::InvalidInput,
            "plan_parts",
            "part_size must be a positive integer",
        ));
    }

    if size == 0 {
        return Err(ServiceError::new(
            ErrorKind::InvalidInput,
            "plan_parts",
            "multipart copy requires a non-empty object",
        ));
    }

    if size > MAX_OBJECT_SIZE {
        return Err(ServiceError::new(
            ErrorKind::ObjectTooLarge,
            "plan_parts",
            format!("object size {size} exceeds maximum {MAX_OBJECT_SIZE}"),
        ));
    }

    let part_count = size.div_ceil(part_size);
    if part_count > MAX_PARTS {
        return Err(ServiceError::new(
            ErrorKind::ObjectTooLarge,
            "plan_parts",
            format!(
                "object size {size} needs {part_count} parts of {part_size} bytes \
                 (max {MAX_PARTS})"
            ),
        ));
    }

    let mut parts = Vec::with_capacity(part_count as usize);
    let mut cursor = 0u64;
    let mut part_number = 1u32;
    while cursor < size {
        let end_exclusive = cursor.saturating_add(part_size).min(size);
        parts.push(PartRange {
            part_number,
            start: cursor,
            end_inclusive: end_exclusive - 1,
        });
        cursor = end_exclusive;
        part_number += 1;
    }

    validate_parts(size, &parts)?;
    Ok(parts)
}

fn validate_parts(size: u64, parts: &[PartRange]) -> Result<(), ServiceError> {
    let invalid = |message: &str| ServiceError::new(ErrorKind::InvalidInput, "plan_parts", message);

    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return Err(invalid("No parts to copy"));
    };

    if first.start != 0 || last.end_inclusive + 1 != size {
        return Err(invalid("Part ranges do not cover the full object"));
    }

    for pair in parts.windows(2) {
        if pair[0].end_inclusive + 1 != pair[1].start
            || pair[0].part_number + 1 != pair[1].part_number
        {
            return Err(invalid("Part ranges overlap or leave gaps"));
        }
    }

    Ok(())
}
