use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut contents = serde_json::to_string_pretty(value)?;
    contents.push('\n');
    return Ok(contents);
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file_contents = to_json(value)?;

    match fs::write(path, file_contents) {
        Ok(_) => Ok(()),
        Err(source) => Err(Error::Write {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use super::write_json;
    use crate::error::Error;
    use tempfile::tempdir;

    #[test]
    fn writes_pretty_json() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("outputs.json");

        let mut outputs = BTreeMap::new();
        outputs.insert("GitHubOIDCProviderArn", "arn:aws:iam::000000000000:oidc-provider/x");
        write_json(&file_path, &outputs).unwrap();

        let contents = fs::read_to_string(&file_path).unwrap();
        let parsed: BTreeMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert_eq!(
            Some(&String::from("arn:aws:iam::000000000000:oidc-provider/x")),
            parsed.get("GitHubOIDCProviderArn")
        );
        assert_eq!(true, contents.ends_with('\n'));
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("missing").join("outputs.json");

        match write_json(&file_path, &BTreeMap::<String, String>::new()) {
            Err(Error::Write { path, .. }) => assert_eq!(true, path.ends_with("outputs.json")),
            other => panic!("Expected `Write` error, got {:?}", other),
        }
    }
}
