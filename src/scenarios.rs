//! Built-in migration scenarios.
//!
//! Each scenario is plain catalog data. Step ids follow the progress records
//! written by the legacy migration tooling, so a progress file left behind by
//! it resumes at the right place.

use strum::{Display, EnumIter, EnumString};

use crate::catalog::{Action, Catalog, ServiceManager, ServiceOperation, Step};
use crate::error::Result;

/// Services stopped before the final database sync, in shutdown order.
pub const SECURETRACK_SERVICES: &[&str] = &[
    "st",
    "crond",
    "mongod",
    "postgresql-11",
    "ldap-cache",
    "commit-manager",
    "device-comm",
    "fqdn-cache",
    "tufin-topology",
    "keycloak",
    "tufin-jobs",
    "tomcat",
    "jms",
];

pub const SECURECHANGE_SERVICES: &[&str] = &["tomcat", "mongod", "postgresql-11"];

const PG_DATA: &str = "/var/lib/pgsql/11/data/";
const PG_DATA_REMOTE: &str = "/opt/tufin/data/volumes/postgres/11/data/";
const SC_DUMP: &str = "/opt/Backups/sc_pg.tar";
/// Undated copy of the configuration backup, so a transfer resumed on a later
/// day still finds the file written by step 7.
pub const ST_CONFIG_BACKUP: &str = "/opt/Backups/st_config.zip";

/// A built-in step catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Scenario {
    /// SecureTrack server migration (steps 1-11)
    SecureTrack,
    /// SecureChange workflow migration (steps 11-16)
    SecureChange,
}

impl Scenario {
    pub fn description(self) -> &'static str {
        match self {
            Self::SecureTrack => "SecureTrack: PostgreSQL data sync, configuration backup, service restart",
            Self::SecureChange => "SecureChange: workflow database dump, MongoDB and Tomcat config transfer",
        }
    }

    pub fn catalog(self) -> Result<Catalog> {
        match self {
            Self::SecureTrack => securetrack(),
            Self::SecureChange => securechange(),
        }
    }
}

/// Unaligned, tuples-only psql query, so stdout is the bare value.
fn psql(sql: &str) -> Vec<String> {
    ["psql", "securetrack", "-Upostgres", "-t", "-A", "-c", sql]
        .map(String::from)
        .to_vec()
}

fn securetrack() -> Result<Catalog> {
    Catalog::new(
        Scenario::SecureTrack.to_string(),
        vec![
            Step::new(1, "Check PostgreSQL version").action(Action::command(["psql", "-V"])),
            Step::new(2, "Check license count").action(Action::Check {
                argv: psql("select count(*) from st_licenses"),
                expect: "1".into(),
                exact: true,
                prompt: "Invalid or EVAL license found. Would you like to delete the EVAL license? (Y/n)"
                    .into(),
                remedy: psql("delete from st_licenses where license_type='evaluation'"),
            }),
            Step::new(3, "Check TOS version").action(Action::command(["tos", "version"])),
            Step::new(4, "Check OS version")
                .action(Action::command(["cat", "/etc/redhat-release"])),
            Step::new(5, "Open preliminary transfer screen session")
                .action(Action::command(["screen", "-dmS", "PreliminaryTransfer"])),
            Step::new(6, "Preliminary PostgreSQL data sync")
                .action(Action::transfer(PG_DATA, PG_DATA_REMOTE)),
            Step::new(7, "Create configuration backup")
                .action(Action::command(["screen", "-dmS", "finalTransfer"]))
                .action(Action::command(["tos", "backup", "--st", "--conf-only", "config"]))
                .action(Action::command(["mkdir", "-p", "/opt/Backups/"]))
                .action(Action::command(["cp", "config_{date}.zip", ST_CONFIG_BACKUP])),
            Step::new(8, "Transfer configuration backup")
                .action(Action::transfer(ST_CONFIG_BACKUP, "/opt/tufin/migration/backup.zip")),
            Step::new(9, "Stop services").action(Action::services(
                ServiceOperation::Stop,
                SECURETRACK_SERVICES.iter().copied(),
            )),
            Step::new(10, "Final PostgreSQL data sync")
                .action(Action::transfer(PG_DATA, PG_DATA_REMOTE)),
            Step::new(11, "Start services")
                .action(Action::services(
                    ServiceOperation::Start,
                    SECURETRACK_SERVICES.iter().copied(),
                ))
                .terminal(),
        ],
    )
}

fn service_action(operation: ServiceOperation) -> Action {
    Action::Services {
        operation,
        services: SECURECHANGE_SERVICES.iter().map(|s| s.to_string()).collect(),
        manager: ServiceManager::Service,
    }
}

fn securechange() -> Result<Catalog> {
    Catalog::new(
        Scenario::SecureChange.to_string(),
        vec![
            Step::new(11, "Create workflow database dump")
                .action(Action::command(["mkdir", "-p", "/opt/Backups/"]))
                .action(Action::command([
                    "pg_dump",
                    "-Upostgres",
                    "-Fc",
                    "securechangeworkflow",
                    "-f",
                    SC_DUMP,
                ])),
            Step::new(12, "Transfer workflow database dump")
                .confirm("Would you like to transfer the file? (Y/n/c)")
                .action(Action::transfer(SC_DUMP, "/opt/tufin/migration_sc/sc_pg.tar")),
            Step::new(14, "Stop services").action(service_action(ServiceOperation::Stop)),
            Step::new(15, "Transfer MongoDB data and Tomcat configuration")
                .action(Action::transfer("/var/lib/mongo/", "/opt/tufin/data/volumes/mongo-sc-rs/"))
                .action(Action::transfer(
                    "/usr/tomcat-8.5.61/conf/catalina.conf",
                    "/opt/tufin/data/volumes/migration-pv/sc/conf/catalina.conf",
                )),
            Step::new(16, "Start services")
                .action(service_action(ServiceOperation::Start))
                .terminal(),
        ],
    )
}
