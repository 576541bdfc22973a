use super::Error;

/// Longest name the engine accepts, including the terminating nul
/// (`ZFS_MAX_DATASET_NAME_LEN`).
pub const MAX_NAME_LEN: usize = 256;

// Pool name prefixes that collide with vdev keywords.
const RESERVED_POOL_PREFIXES: &[&str] = &["mirror", "raidz", "draid", "spare"];

/// Validates a full dataset or snapshot name, e.g. `tank/data` or
/// `tank/data@snap`.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::invalid_name(name, "name cannot be empty"));
    }
    if name.len() >= MAX_NAME_LEN {
        return Err(Error::invalid_name(name, "name too long"));
    }

    let (dataset, snapshot) = match name.split_once('@') {
        Some((dataset, snapshot)) => (dataset, Some(snapshot)),
        None => (name, None),
    };

    validate_dataset_name(dataset).map_err(|err| rename(err, name))?;

    if let Some(snapshot) = snapshot {
        if snapshot.contains('@') {
            return Err(Error::invalid_name(name, "too many '@' characters"));
        }
        validate_component(snapshot, false).map_err(|err| rename(err, name))?;
    }
    Ok(())
}

/// Validates a ZFS dataset path (no snapshot part).
pub(crate) fn validate_dataset_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::invalid_name(name, "name cannot be empty"));
    }
    for (i, comp) in name.split('/').enumerate() {
        if comp.is_empty() {
            let reason = if i == 0 {
                "leading slash"
            } else if name.ends_with('/') {
                "trailing slash"
            } else {
                "empty component"
            };
            return Err(Error::invalid_name(name, reason));
        }
        if i == 0 {
            validate_pool_name(comp)
        } else {
            validate_component(comp, true)
        }
        .map_err(|err| rename(err, name))?;
    }
    Ok(())
}

/// Validates the first component of a dataset name.
fn validate_pool_name(pool: &str) -> Result<(), Error> {
    validate_component(pool, true)?;

    // Safe to unwrap: validate_component() rejects empty names.
    let first_char = pool.chars().next().unwrap();
    if !first_char.is_ascii_alphabetic() {
        return Err(Error::invalid_name(
            pool,
            "pool name must begin with a letter",
        ));
    }
    if pool == "log" || RESERVED_POOL_PREFIXES.iter().any(|r| pool.starts_with(r)) {
        return Err(Error::invalid_name(pool, "pool name is reserved"));
    }
    Ok(())
}

/// Validates a ZFS component (i.e. part of a dataset or snapshot name).
pub(crate) fn validate_component(name: &str, is_dataset: bool) -> Result<(), Error> {
    // ZFS dataset component must match something like the regular expression
    // [a-zA-Z0-9][a-zA-Z0-9-_:.]*. We also reject spaces.

    if name.len() >= MAX_NAME_LEN {
        return Err(Error::invalid_name(name, "name too long"));
    }

    if name.is_empty() {
        return Err(Error::invalid_name(name, "name cannot be empty"));
    }

    if name == "." || name == ".." {
        return Err(Error::invalid_name(name, "reserved component"));
    }

    let mut chars = name.chars();

    // Snapshots can begin with a non-alphanumeric character.
    if is_dataset {
        let first_char = chars.next().unwrap();
        if !first_char.is_ascii_alphanumeric() {
            return Err(Error::invalid_name(
                name,
                &format!("name cannot begin with '{}'", first_char),
            ));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' && c != ':' {
            return Err(Error::invalid_name(
                name,
                &format!("invalid character '{}' in name", c),
            ));
        }
    }

    Ok(())
}

// Report a component error against the full name.
fn rename(err: Error, full_name: &str) -> Error {
    match err {
        Error::InvalidName { reason, .. } => Error::InvalidName {
            name: full_name.to_string(),
            reason,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("pool/data@snap").is_ok());
        assert!(validate_name("pool").is_ok());
        assert!(validate_name("pool@2023-12-01").is_ok());
        assert!(validate_name("rpool/ROOT/default@-checkpoint").is_ok());

        assert!(validate_name("").is_err()); // empty
        assert!(validate_name("@snap").is_err()); // no dataset
        assert!(validate_name("pool@").is_err()); // no snapshot
        assert!(validate_name("pool@a@b").is_err()); // two '@'
        assert!(validate_name("pool/@snap").is_err()); // trailing slash before '@'
        assert!(validate_name("pool@snap/child").is_err()); // slash in snapshot
        assert!(validate_name("pool@.").is_err()); // self reference
        assert!(validate_name("pool@..").is_err()); // parent reference
    }

    #[test]
    fn test_name_length() {
        // 255 bytes plus the nul is the engine's limit.
        let longest = format!("p/{}", "a".repeat(MAX_NAME_LEN - 3));
        assert_eq!(longest.len(), MAX_NAME_LEN - 1);
        assert!(validate_name(&longest).is_ok());

        let too_long = format!("p/{}", "a".repeat(MAX_NAME_LEN - 2));
        assert!(validate_name(&too_long).is_err());

        let err = validate_name(&"a".repeat(300)).unwrap_err();
        assert!(matches!(err, Error::InvalidName { ref reason, .. } if reason == "name too long"));
    }

    #[test]
    fn test_dataset_name_validation() {
        assert!(validate_dataset_name("tank").is_ok());
        assert!(validate_dataset_name("tank/ROOT").is_ok());
        assert!(validate_dataset_name("rpool/ROOT/default").is_ok());
        assert!(validate_dataset_name("tank/data/projects/work/client1/files").is_ok());

        // Invalid dataset names
        assert!(validate_dataset_name("").is_err()); // empty
        assert!(validate_dataset_name("/tank").is_err()); // leading slash
        assert!(validate_dataset_name("tank/").is_err()); // trailing slash
        assert!(validate_dataset_name("tank//ROOT").is_err()); // double slash
        assert!(validate_dataset_name("tank/ROOT/").is_err()); // trailing slash
        assert!(validate_dataset_name("tank/ /ROOT").is_err()); // space in component
        assert!(validate_dataset_name("tank/@invalid").is_err()); // invalid char
        assert!(validate_dataset_name("tank/ROOT/test name").is_err()); // space
        assert!(validate_dataset_name("-invalid/ROOT").is_err()); // starts with dash
        assert!(validate_dataset_name("tank/.invalid").is_err()); // component starts with dot
        assert!(validate_dataset_name("tank/_invalid").is_err()); // component starts with underscore
    }

    #[test]
    fn test_pool_name_validation() {
        assert!(validate_dataset_name("zroot").is_ok());
        assert!(validate_dataset_name("tank1/data").is_ok());
        assert!(validate_dataset_name("log").is_err()); // vdev keyword
        assert!(validate_dataset_name("logs").is_ok()); // only "log" itself is reserved
        assert!(validate_dataset_name("spare1").is_err()); // begins with a vdev keyword
        assert!(validate_dataset_name("mirror/data").is_err());
        assert!(validate_dataset_name("raidz2").is_err());
        assert!(validate_dataset_name("1tank").is_err()); // begins with a digit
        assert!(validate_dataset_name("tank/123").is_ok()); // digits are fine below the pool
    }

    #[test]
    fn test_component_validation_datasets() {
        // Valid dataset components
        assert!(validate_component("tank", true).is_ok());
        assert!(validate_component("ROOT", true).is_ok());
        assert!(validate_component("my-env", true).is_ok());
        assert!(validate_component("test_env", true).is_ok());
        assert!(validate_component("env.backup", true).is_ok());
        assert!(validate_component("ns:tagged", true).is_ok());
        assert!(validate_component("123numbers", true).is_ok());

        // Invalid dataset components
        assert!(validate_component("", true).is_err()); // empty
        assert!(validate_component("-invalid", true).is_err()); // starts with dash
        assert!(validate_component(".invalid", true).is_err()); // starts with dot
        assert!(validate_component(":invalid", true).is_err()); // starts with colon
        assert!(validate_component("invalid name", true).is_err()); // space
        assert!(validate_component("invalid@name", true).is_err()); // @ symbol
        assert!(validate_component("invalid/name", true).is_err()); // slash
        assert!(validate_component("invalid#name", true).is_err()); // hash
        assert!(validate_component(&"a".repeat(256), true).is_err()); // too long
    }

    #[test]
    fn test_component_validation_snapshots() {
        // Valid snapshot components (less restrictive first character)
        assert!(validate_component("backup", false).is_ok());
        assert!(validate_component("2023-12-01", false).is_ok());
        assert!(validate_component("-checkpoint", false).is_ok());
        assert!(validate_component(".hidden", false).is_ok());
        assert!(validate_component("_private", false).is_ok());

        // Still invalid characters for snapshots
        assert!(validate_component("", false).is_err()); // empty
        assert!(validate_component(".", false).is_err()); // self reference
        assert!(validate_component("invalid name", false).is_err()); // space
        assert!(validate_component("invalid@name", false).is_err()); // @ symbol
        assert!(validate_component("invalid/name", false).is_err()); // slash
    }

    #[test]
    fn test_validation_error_messages() {
        // Errors name the full dataset, not the failing component.
        let result = validate_name("tank/-invalid/ROOT");
        if let Err(Error::InvalidName { name, reason }) = result {
            assert_eq!(name, "tank/-invalid/ROOT");
            assert_eq!(reason, "name cannot begin with '-'");
        } else {
            panic!("Expected InvalidName error");
        }

        let result = validate_name("tank/ROOT@bad snap");
        if let Err(Error::InvalidName { name, reason }) = result {
            assert_eq!(name, "tank/ROOT@bad snap");
            assert_eq!(reason, "invalid character ' ' in name");
        } else {
            panic!("Expected InvalidName error");
        }

        let result = validate_name("tank//ROOT");
        if let Err(Error::InvalidName { reason, .. }) = result {
            assert_eq!(reason, "empty component");
        } else {
            panic!("Expected InvalidName error");
        }
    }
}
