// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The handful of `package.json` fields a start looks at

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::Error;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PackageInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub module_type: Option<String>,
    #[serde(default)]
    pub egg: Option<EggSection>,
    #[serde(default, rename = "eggScriptsConfig")]
    pub scripts_config: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EggSection {
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub revert: Option<OneOrMany>,
    #[serde(default)]
    pub typescript: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(one) => vec![one.clone()],
            OneOrMany::Many(many) => many.clone(),
        }
    }
}

impl PackageInfo {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join("package.json")
    }

    /// Reads `<dir>/package.json`
    pub fn read(dir: &Path) -> Result<Self, Error> {
        let path = Self::path(dir);
        let contents = fs::read_to_string(&path)
            .map_err(|err| Error::config(format!("failed to read {}: {err}", path.display())))?;
        Self::parse(&contents)
            .map_err(|err| Error::config(format!("failed to parse {}: {err}", path.display())))
    }

    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    pub fn is_esm(&self) -> bool {
        self.module_type.as_deref() == Some("module")
    }

    pub fn framework(&self) -> Option<&str> {
        self.egg.as_ref()?.framework.as_deref()
    }

    pub fn reverts(&self) -> Vec<String> {
        self.egg
            .as_ref()
            .and_then(|egg| egg.revert.as_ref())
            .map(OneOrMany::to_vec)
            .unwrap_or_default()
    }

    pub fn typescript(&self) -> bool {
        self.egg
            .as_ref()
            .and_then(|egg| egg.typescript)
            .unwrap_or(false)
    }
}
