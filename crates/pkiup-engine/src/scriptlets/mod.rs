mod fix_default_tomcat_files;

pub use fix_default_tomcat_files::FixDefaultTomcatFiles;
