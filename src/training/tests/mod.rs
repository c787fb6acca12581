//! Training loop tests on small synthetic datasets

mod multitask_tests;
mod trainer_tests;
