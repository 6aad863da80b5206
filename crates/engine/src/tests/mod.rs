mod helpers;

mod recovery_tests;
mod replication_tests;
