// Static plugin registry
// Script names are bound to factories by explicit registration at startup

use super::args::{parse, ListArgs, MailArgs, NoArgs, RenameArgs, TransferArgs};
use super::mail::SendFiles;
use super::transfer::{ListFiles, ProtocolKind, TransferFiles};
use super::workspace::{CreateWorkspace, DeleteWorkspace, RenameFiles};
use super::Plugin;
use crate::errors::PluginError;
use crate::models::Direction;
use std::collections::BTreeMap;
use tracing::debug;

/// Builds a plugin from its rendered argument document
pub type PluginFactory = Box<dyn Fn(&str) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync>;

struct Entry {
    description: &'static str,
    factory: PluginFactory,
}

/// Mapping from script name to plugin factory
#[derive(Default)]
pub struct PluginRegistry {
    entries: BTreeMap<&'static str, Entry>,
}

impl PluginRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_defaults();
        registry
    }

    /// Register `factory` under `name`, replacing any earlier registration
    pub fn register<F>(&mut self, name: &'static str, description: &'static str, factory: F)
    where
        F: Fn(&str) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        debug!(plugin = name, "Registering plugin");
        self.entries.insert(
            name,
            Entry {
                description,
                factory: Box::new(factory),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Build the plugin registered as `name` from its arguments
    pub fn create(&self, name: &str, arguments: &str) -> Result<Box<dyn Plugin>, PluginError> {
        let entry = self.entries.get(name).ok_or_else(|| {
            PluginError::Configuration(format!("No plugin registered for script '{}'", name))
        })?;
        (entry.factory)(arguments)
    }

    /// (name, description) of every registered plugin, sorted by name
    pub fn entries(&self) -> Vec<(&'static str, &'static str)> {
        self.entries
            .iter()
            .map(|(name, entry)| (*name, entry.description))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn register_transfer_family(&mut self, kind: ProtocolKind, names: [(&'static str, &'static str); 3]) {
        let [(list, list_description), (download, download_description), (upload, upload_description)] =
            names;

        self.register(list, list_description, move |raw| {
            let args = parse::<ListArgs>(raw)?.validate()?;
            Ok(Box::new(ListFiles::new(list, kind, args)) as Box<dyn Plugin>)
        });
        self.register(download, download_description, move |raw| {
            let args = parse::<TransferArgs>(raw)?.validate()?;
            Ok(Box::new(TransferFiles::new(download, kind, Direction::Download, args)) as Box<dyn Plugin>)
        });
        self.register(upload, upload_description, move |raw| {
            let args = parse::<TransferArgs>(raw)?.validate()?;
            Ok(Box::new(TransferFiles::new(upload, kind, Direction::Upload, args)) as Box<dyn Plugin>)
        });
    }

    fn register_defaults(&mut self) {
        self.register_transfer_family(
            ProtocolKind::LocalDirectory,
            [
                ("local_directory_list_files", "List files in a local directory"),
                ("local_directory_download_files", "Copy files from a local directory into the workspace"),
                ("local_directory_upload_files", "Copy workspace files to a local directory"),
            ],
        );
        self.register_transfer_family(
            ProtocolKind::Ftp,
            [
                ("ftp_list_files", "List files on an FTP server"),
                ("ftp_download", "Download files from an FTP server"),
                ("ftp_upload", "Upload workspace files to an FTP server"),
            ],
        );
        self.register_transfer_family(
            ProtocolKind::Sftp,
            [
                ("sftp_list_files", "List files on an SFTP server"),
                ("sftp_download", "Download files from an SFTP server"),
                ("sftp_upload", "Upload workspace files to an SFTP server"),
            ],
        );
        self.register_transfer_family(
            ProtocolKind::SmbCifs,
            [
                ("smb_cifs_list_files", "List files on an SMB/CIFS share"),
                ("smb_cifs_download", "Download files from an SMB/CIFS share"),
                ("smb_cifs_upload", "Upload workspace files to an SMB/CIFS share"),
            ],
        );

        self.register("workspace_create", "Create the run workspace", |raw| {
            parse::<NoArgs>(raw)?;
            Ok(Box::new(CreateWorkspace) as Box<dyn Plugin>)
        });
        self.register("workspace_delete", "Delete the run workspace", |raw| {
            parse::<NoArgs>(raw)?;
            Ok(Box::new(DeleteWorkspace) as Box<dyn Plugin>)
        });
        self.register(
            "workspace_rename_files",
            "Rename matching workspace files",
            |raw| {
                let args = parse::<RenameArgs>(raw)?.validate()?;
                Ok(Box::new(RenameFiles::new(args)) as Box<dyn Plugin>)
            },
        );
        self.register(
            "mail_send_files",
            "Mail matching workspace files as attachments",
            |raw| {
                let args = parse::<MailArgs>(raw)?.validate()?;
                Ok(Box::new(SendFiles::new(args)) as Box<dyn Plugin>)
            },
        );
    }
}
