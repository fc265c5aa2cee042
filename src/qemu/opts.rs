//! Ordered QEMU command-line options.
//!
//! QEMU parses some constructs statefully (fd inheritance follows device
//! creation order), so entries are serialized exactly in insertion order.

use std::fmt;

/// Ordered list of `key=value` pairs.
pub type KeyVals = Vec<(String, String)>;

/// Value of one option entry. The variant decides how it is rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
    /// `-key`
    Flag,
    /// `-key value`
    Value(String),
    /// `-key k1=v1,k2=v2`
    KeyVal(KeyVals),
    /// one `-key name,k1=v1,k2=v2` per group
    Groups(Vec<(String, KeyVals)>),
}

/// One option entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuOpt {
    pub key: String,
    pub value: OptValue,
}

fn keyvals<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> KeyVals
where
    K: Into<String>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect()
}

fn join_keyvals(pairs: &KeyVals) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

impl QemuOpt {
    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: OptValue::Flag,
        }
    }

    pub fn value(key: impl Into<String>, value: impl ToString) -> Self {
        Self {
            key: key.into(),
            value: OptValue::Value(value.to_string()),
        }
    }

    pub fn keyval<K, V>(key: impl Into<String>, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: ToString,
    {
        Self {
            key: key.into(),
            value: OptValue::KeyVal(keyvals(pairs)),
        }
    }

    /// A single nested group, e.g. `-netdev tap,id=nic0,...`.
    pub fn group<K, V>(
        key: impl Into<String>,
        name: impl Into<String>,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: ToString,
    {
        Self {
            key: key.into(),
            value: OptValue::Groups(vec![(name.into(), keyvals(pairs))]),
        }
    }

    /// Several nested groups sharing one key.
    pub fn groups(key: impl Into<String>, groups: Vec<(String, KeyVals)>) -> Self {
        Self {
            key: key.into(),
            value: OptValue::Groups(groups),
        }
    }

    /// Words of this entry, one `[-key]` or `[-key, value]` per rendered option.
    fn words(&self) -> Vec<Vec<String>> {
        let switch = format!("-{}", self.key);
        match &self.value {
            OptValue::Flag => vec![vec![switch]],
            OptValue::Value(v) if v.is_empty() => vec![vec![switch]],
            OptValue::Value(v) => vec![vec![switch, v.clone()]],
            OptValue::KeyVal(pairs) => vec![vec![switch, join_keyvals(pairs)]],
            OptValue::Groups(groups) => groups
                .iter()
                .map(|(name, pairs)| {
                    let value = if pairs.is_empty() {
                        name.clone()
                    } else {
                        format!("{},{}", name, join_keyvals(pairs))
                    };
                    vec![switch.clone(), value]
                })
                .collect(),
        }
    }

    /// Rendered arguments for this entry (one per group for [`OptValue::Groups`]).
    pub fn to_args(&self) -> Vec<String> {
        self.words().into_iter().map(|w| w.join(" ")).collect()
    }

    /// Argument vector for this entry, each value a single word.
    pub fn argv(&self) -> Vec<String> {
        self.words().into_iter().flatten().collect()
    }
}

/// The option tree handed to QEMU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QemuOpts {
    opts: Vec<QemuOpt>,
    ext_args: Vec<String>,
}

impl QemuOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, opt: QemuOpt) {
        self.opts.push(opt);
    }

    /// Appends a boolean option; `false` adds nothing.
    pub fn append_bool(&mut self, key: &str, enabled: bool) {
        if enabled {
            self.append(QemuOpt::flag(key));
        }
    }

    /// Raw tokens (fd redirections) emitted after all structured options.
    pub fn append_ext_arg(&mut self, token: impl Into<String>) {
        self.ext_args.push(token.into());
    }

    pub fn opts(&self) -> &[QemuOpt] {
        &self.opts
    }

    pub fn ext_args(&self) -> &[String] {
        &self.ext_args
    }

    /// All entries with the given key, in order.
    pub fn find<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a QemuOpt> + 'a {
        self.opts.iter().filter(move |o| o.key == key)
    }

    /// Argument vector of the structured options; ext args are not included.
    pub fn argv(&self) -> Vec<String> {
        self.opts.iter().flat_map(QemuOpt::argv).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.opts.is_empty() && self.ext_args.is_empty()
    }

    pub fn to_args(&self) -> String {
        self.opts
            .iter()
            .flat_map(QemuOpt::to_args)
            .chain(self.ext_args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for QemuOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_args())
    }
}
