pub const MANIFESTS_ROOT: &str = "manifests";
pub const REPORTS_ROOT: &str = "reports";

pub fn manifest_object_key(execution_id: &str) -> String {
    format!("{MANIFESTS_ROOT}/{execution_id}/manifest.json")
}

pub fn report_object_key(execution_id: &str) -> String {
    format!("{REPORTS_ROOT}/{execution_id}/report.json")
}

/// Returns the part of `key` below `source_prefix`.
///
/// Keys that do not start with the prefix are returned unchanged.
pub fn strip_source_prefix<'a>(key: &'a str, source_prefix: &str) -> &'a str {
    if source_prefix.is_empty() {
        return key;
    }
    key.strip_prefix(source_prefix).unwrap_or(key)
}

/// `dest_prefix + stripPrefix(key, source_prefix)`.
pub fn destination_key(key: &str, source_prefix: &str, dest_prefix: &str) -> String {
    format!("{dest_prefix}{}", strip_source_prefix(key, source_prefix))
}

pub fn s3_uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_manifest_and_report_keys() {
        assert_eq!(
            manifest_object_key("exec-123"),
            "manifests/exec-123/manifest.json"
        );
        assert_eq!(report_object_key("exec-123"), "reports/exec-123/report.json");
    }

    #[test]
    fn rewrites_source_prefix_to_destination_prefix() {
        assert_eq!(
            destination_key("incoming/2026/a.bin", "incoming/", "archive/"),
            "archive/2026/a.bin"
        );
    }

    #[test]
    fn keeps_key_when_prefix_does_not_match() {
        assert_eq!(
            destination_key("other/a.bin", "incoming/", "archive/"),
            "archive/other/a.bin"
        );
    }

    #[test]
    fn empty_prefixes_preserve_key() {
        assert_eq!(destination_key("a/b.bin", "", ""), "a/b.bin");
        assert_eq!(destination_key("incoming/b.bin", "incoming/", ""), "b.bin");
    }

    #[test]
    fn formats_s3_uri() {
        assert_eq!(s3_uri("hub", "reports/x/report.json"), "s3://hub/reports/x/report.json");
    }
}
