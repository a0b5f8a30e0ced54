mod laziness_tests;
mod support;
