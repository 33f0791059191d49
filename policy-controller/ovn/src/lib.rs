//! An [`SdnClient`] backed by the OVN northbound database.
//!
//! Every operation is a single `ovn-nbctl` invocation (or transaction), so
//! each call either applies entirely or not at all. Creation is idempotent:
//! port groups and address sets are looked up by name before being created,
//! and a direction's ACL is replaced rather than added alongside an existing
//! one.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod acl;
mod nbctl;


pub use self::nbctl::{Config, Error, Nbctl};
use anyhow::Result;
use netpol_controller_core::{Direction, PortSpec, SdnClient};

/// Maps a controller name to an OVN identifier.
///
/// OVN identifiers may not contain `-`. Kubernetes names never contain `_`, so
/// the mapping is injective.
pub fn ovn_name(name: &str) -> String {
    name.replace('-', "_")
}

#[async_trait::async_trait]
impl SdnClient for Nbctl {
    async fn create_port_group(&self, name: &str) -> Result<()> {
        let pg = ovn_name(name);
        if self.exists("port_group", &pg).await? {
            return Ok(());
        }
        let external_id = format!("external_ids:netpol_name=\"{name}\"");
        self.run(&["pg-add", &pg, "--", "set", "port_group", &pg, &external_id])
            .await?;
        tracing::info!(port_group = %pg, "Created port group");
        Ok(())
    }

    async fn create_address_set(&self, name: &str) -> Result<()> {
        let set = ovn_name(name);
        if self.exists("address_set", &set).await? {
            return Ok(());
        }
        let name_column = format!("name={set}");
        let external_id = format!("external_ids:netpol_name=\"{name}\"");
        self.run(&["create", "address_set", &name_column, &external_id])
            .await?;
        tracing::info!(address_set = %set, "Created address set");
        Ok(())
    }

    async fn create_ingress_acl(
        &self,
        port_group: &str,
        allow: &str,
        except: &str,
        ports: &[PortSpec],
    ) -> Result<()> {
        self.replace_acl(Direction::Ingress, port_group, allow, except, ports)
            .await
    }

    async fn create_egress_acl(
        &self,
        port_group: &str,
        allow: &str,
        except: &str,
        ports: &[PortSpec],
    ) -> Result<()> {
        self.replace_acl(Direction::Egress, port_group, allow, except, ports)
            .await
    }

    async fn delete_acl(&self, port_group: &str, direction: Direction) -> Result<()> {
        let pg = ovn_name(port_group);
        // acl-del fails when the entity is missing.
        if !self.exists("port_group", &pg).await? {
            return Ok(());
        }
        self.run(&[
            "--type=port-group",
            "acl-del",
            &pg,
            acl::pipeline(direction),
        ])
        .await?;
        tracing::info!(port_group = %pg, %direction, "Deleted ACL");
        Ok(())
    }

    async fn delete_address_set(&self, name: &str) -> Result<()> {
        let set = ovn_name(name);
        self.run(&["--if-exists", "destroy", "address_set", &set])
            .await?;
        tracing::debug!(address_set = %set, "Deleted address set");
        Ok(())
    }

    async fn delete_port_group(&self, name: &str) -> Result<()> {
        let pg = ovn_name(name);
        self.run(&["--if-exists", "destroy", "port_group", &pg]).await?;
        tracing::debug!(port_group = %pg, "Deleted port group");
        Ok(())
    }
}

// === impl Nbctl ===

impl Nbctl {
    async fn exists(&self, table: &str, name: &str) -> Result<bool, Error> {
        let condition = format!("name={name}");
        let uuids = self
            .run(&[
                "--data=bare",
                "--no-heading",
                "--columns=_uuid",
                "find",
                table,
                &condition,
            ])
            .await?;
        Ok(!uuids.is_empty())
    }

    async fn replace_acl(
        &self,
        direction: Direction,
        port_group: &str,
        allow: &str,
        except: &str,
        ports: &[PortSpec],
    ) -> Result<()> {
        let pg = ovn_name(port_group);
        let pipeline = acl::pipeline(direction);
        let priority = acl::PRIORITY.to_string();
        let expr = acl::build_match(direction, &pg, &ovn_name(allow), &ovn_name(except), ports);
        // Deleting and adding in one transaction replaces the ACL atomically.
        self.run(&[
            "--type=port-group",
            "acl-del",
            &pg,
            pipeline,
            "--",
            "--type=port-group",
            "acl-add",
            &pg,
            pipeline,
            &priority,
            &expr,
            "allow-related",
        ])
        .await?;
        tracing::info!(port_group = %pg, %direction, "Set ACL");
        Ok(())
    }
}
